use std::fmt;

use serde::{Deserialize, Serialize};

/// How the chain is driven forward: execute everything, snapshot state at a
/// pivot, or track headers only.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Fast,
    Light,
}

impl SyncMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "full" => Some(Self::Full),
            "fast" => Some(Self::Fast),
            "light" => Some(Self::Light),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Fast => "fast",
            Self::Light => "light",
        }
    }

    pub(crate) fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::Fast,
            2 => Self::Light,
            _ => Self::Full,
        }
    }

    pub(crate) fn as_u32(self) -> u32 {
        match self {
            Self::Full => 0,
            Self::Fast => 1,
            Self::Light => 2,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_modes_only() {
        assert_eq!(SyncMode::parse("full"), Some(SyncMode::Full));
        assert_eq!(SyncMode::parse("fast"), Some(SyncMode::Fast));
        assert_eq!(SyncMode::parse("light"), Some(SyncMode::Light));
        assert_eq!(SyncMode::parse("FULL"), None);
        assert_eq!(SyncMode::parse("warp"), None);
    }

    #[test]
    fn serde_round_trip_uses_lowercase_strings() {
        let encoded = serde_json::to_string(&SyncMode::Fast).expect("encode");
        assert_eq!(encoded, "\"fast\"");
        let decoded: SyncMode = serde_json::from_str("\"light\"").expect("decode");
        assert_eq!(decoded, SyncMode::Light);
        assert!(serde_json::from_str::<SyncMode>("\"warp\"").is_err());
    }

    #[test]
    fn atomic_tag_round_trip() {
        for mode in [SyncMode::Full, SyncMode::Fast, SyncMode::Light] {
            assert_eq!(SyncMode::from_u32(mode.as_u32()), mode);
        }
    }
}

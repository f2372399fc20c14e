use std::fmt;

/// Failure taxonomy of the sync engine. The mapping of each kind to the
/// peer outcome (drop or keep) and the caller outcome is part of the
/// engine's contract and is exercised by `Downloader::synchronise`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// A sync is already running; the caller should retry later.
    Busy,
    /// The sync was cancelled on request; not a failure.
    Canceled,
    /// The named peer is not registered.
    UnknownPeer,
    /// A peer with this id is already registered.
    AlreadyRegistered,
    /// Protocol violation: wrong counts, unrequested data, stale headers.
    BadPeer(String),
    /// The peer promised a heavier chain but never delivered it.
    StallingPeer,
    /// The peer's head is below our trusted checkpoint.
    UnsyncedPeer,
    /// No peers registered to keep the download active.
    NoPeers,
    /// Zero-length header response where headers were required.
    EmptyHeaderSet,
    /// Every peer was tried and none could serve the pending work.
    PeersUnavailable,
    /// The resolved common ancestor is below the allowed floor.
    InvalidAncestor,
    /// Parent-link or root check failed; header rollback was scheduled.
    InvalidChain(String),
    /// Delivered transactions/uncles do not hash to the header roots.
    InvalidBody,
    /// Delivered receipts do not hash to the header receipt root.
    InvalidReceipt,
    /// The state scheduler rejected delivered trie data.
    InvalidState(String),
    /// State-trie retrieval cancelled on request.
    CancelStateFetch,
    /// Content processing cancelled on request.
    CancelContentProcessing,
    /// The master peer or an internal wait exceeded its deadline.
    Timeout,
    /// Peer speaks a protocol version older than supported.
    TooOld,
    /// A delivery arrived while no sync was running.
    NoSyncActive,
    /// A delivery arrived for a request that is no longer tracked.
    StaleDelivery,
}

impl SyncError {
    /// Whether `synchronise` should ask the transport to drop the peer.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            SyncError::BadPeer(_)
                | SyncError::StallingPeer
                | SyncError::UnsyncedPeer
                | SyncError::EmptyHeaderSet
                | SyncError::InvalidAncestor
                | SyncError::InvalidChain(_)
                | SyncError::InvalidBody
                | SyncError::InvalidReceipt
                | SyncError::Timeout
                | SyncError::TooOld
        )
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Busy => write!(f, "busy"),
            SyncError::Canceled => write!(f, "syncing canceled (requested)"),
            SyncError::UnknownPeer => write!(f, "peer is unknown or unhealthy"),
            SyncError::AlreadyRegistered => write!(f, "peer is already registered"),
            SyncError::BadPeer(reason) => write!(f, "action from bad peer ignored: {reason}"),
            SyncError::StallingPeer => write!(f, "peer is stalling"),
            SyncError::UnsyncedPeer => write!(f, "unsynced peer"),
            SyncError::NoPeers => write!(f, "no peers to keep download active"),
            SyncError::EmptyHeaderSet => write!(f, "empty header set by peer"),
            SyncError::PeersUnavailable => {
                write!(f, "no peers available or all tried for download")
            }
            SyncError::InvalidAncestor => write!(f, "retrieved ancestor is invalid"),
            SyncError::InvalidChain(reason) => {
                write!(f, "retrieved hash chain is invalid: {reason}")
            }
            SyncError::InvalidBody => write!(f, "retrieved block body is invalid"),
            SyncError::InvalidReceipt => write!(f, "retrieved receipt is invalid"),
            SyncError::InvalidState(reason) => {
                write!(f, "retrieved state data is invalid: {reason}")
            }
            SyncError::CancelStateFetch => {
                write!(f, "state data download canceled (requested)")
            }
            SyncError::CancelContentProcessing => {
                write!(f, "content processing canceled (requested)")
            }
            SyncError::Timeout => write!(f, "timeout"),
            SyncError::TooOld => {
                write!(f, "peer doesn't speak recent enough protocol version (need >= 63)")
            }
            SyncError::NoSyncActive => write!(f, "no sync active"),
            SyncError::StaleDelivery => write!(f, "delivery for untracked request"),
        }
    }
}

impl std::error::Error for SyncError {}

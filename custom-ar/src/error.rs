use crate::types::Rank;

pub type Result<T> = std::result::Result<T, CustomArError>;

#[derive(Debug, thiserror::Error)]
pub enum CustomArError {
    #[error("custom allreduce initialization failed: {reason}")]
    Initialization { reason: String },

    #[error("scratch buffer too small: {required} bytes required, {actual} available")]
    InsufficientScratch { required: usize, actual: usize },

    #[error("buffer 0x{ptr:x} is not registered with this communicator")]
    UnregisteredBuffer { ptr: u64 },

    #[error("peer {rank} unavailable: {reason}")]
    PeerUnavailable { rank: Rank, reason: String },

    #[error("communicator {handle} used after dispose")]
    UseAfterDispose { handle: u64 },

    #[error("graph buffer metadata epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch { expected: u64, actual: u64 },

    #[error("rank data exhausted: all {capacity} buffer slots are in use")]
    RankDataExhausted { capacity: usize },

    #[error("graph buffer metadata decode failed: {0}")]
    MetadataDecode(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IPC error: {message}")]
    Ipc { message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl CustomArError {
    /// Create an `Initialization` error.
    pub fn initialization(reason: impl Into<String>) -> Self {
        Self::Initialization {
            reason: reason.into(),
        }
    }

    /// Create an `Ipc` error.
    pub fn ipc(message: impl Into<String>) -> Self {
        Self::Ipc {
            message: message.into(),
        }
    }

    /// True for failures that leave shared memory in an undefined state.
    ///
    /// The communicator must be disposed and recreated after one of these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PeerUnavailable { .. } | Self::Stream(_) | Self::LockPoisoned(_)
        )
    }
}

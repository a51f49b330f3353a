/// Error kinds reported by runtime operations.
///
/// Bad arguments (unknown segments, foreign units, stale handles) are
/// reported as [DartError::InvalidArgument] and leave the runtime usable.
/// [DartError::Again] is transient and only produced by operations that can
/// be retried, such as [AmQueue::try_send][crate::AmQueue::try_send].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DartError {
    InvalidArgument(String),
    NotFound(String),
    Again,
    OutOfMemory(usize),
    CommunicationFailure(String),
    Other(String),
}

impl std::fmt::Display for DartError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DartError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            DartError::NotFound(what) => write!(f, "not found: {}", what),
            DartError::Again => write!(f, "resource temporarily unavailable, try again"),
            DartError::OutOfMemory(size) => {
                write!(f, "not enough memory to allocate {} bytes", size)
            }
            DartError::CommunicationFailure(msg) => write!(f, "communication failure: {}", msg),
            DartError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for DartError {}

impl From<bincode::Error> for DartError {
    fn from(err: bincode::Error) -> Self {
        DartError::Other(format!("serialization error: {}", err))
    }
}

pub type DartResult<T> = Result<T, DartError>;

pub(crate) fn invalid<T>(msg: impl Into<String>) -> DartResult<T> {
    Err(DartError::InvalidArgument(msg.into()))
}

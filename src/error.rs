use std::fmt;

/// Main error type for cunn.
///
/// Every failure is fatal to the enclosing forward/backward call: there is no
/// internal retry and no partial result. The variants mirror the stages of a
/// call, and each carries the backend's status name where one was available.
#[derive(Debug, Clone)]
pub enum CunnError {
    /// Handle or descriptor creation failed at layer construction.
    Initialization(String),
    /// A descriptor-set call was rejected (bad shape/stride/pad/dtype combination).
    Configuration(String),
    /// Device memory exhausted for a workspace, output or error buffer.
    Allocation(String),
    /// A compute operation was rejected by the backend at invocation time.
    Execution(String),
    /// Required input tensor missing or invalid for the requested operation.
    Input(String),
}

impl fmt::Display for CunnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization(msg) => write!(f, "initialization failed: {}", msg),
            Self::Configuration(msg) => write!(f, "descriptor configuration rejected: {}", msg),
            Self::Allocation(msg) => write!(f, "device allocation failed: {}", msg),
            Self::Execution(msg) => write!(f, "compute operation failed: {}", msg),
            Self::Input(msg) => write!(f, "invalid input: {}", msg),
        }
    }
}

impl std::error::Error for CunnError {}

/// Result type alias for cunn operations.
pub type CunnResult<T> = std::result::Result<T, CunnError>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Platform not supported: {0}")]
    PlatformNotSupported(String),

    #[error("Platform triple has already been initialized")]
    TripleAlreadyInitialized,

    #[error("Cannot detour 0x{address:X} to itself")]
    SelfDetour { address: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No detour encoding from 0x{from:X} to 0x{to:X} fits in {max_size} bytes")]
    NoDetourEncoding {
        from: usize,
        to: usize,
        max_size: usize,
    },

    #[error("Failed to allocate {size} bytes (alignment {alignment}): {message}")]
    AllocationFailed {
        size: usize,
        alignment: usize,
        message: String,
    },

    #[error("Failed to read memory at address {address:#x}: {message}")]
    MemoryReadFailed { address: usize, message: String },

    #[error("Failed to change protection at address {address:#x}: {message}")]
    MemoryProtectFailed { address: usize, message: String },

    #[error("Entry point of {method} did not stabilize after {iterations} iterations")]
    EntryPointUnstable { method: String, iterations: usize },

    #[error("Thunk walk for {method} looped back to 0x{entry:X}")]
    ThunkLoop { method: String, entry: usize },

    #[error("Failed to create alternate entry point: {0}")]
    AltEntryFailed(String),

    #[error("Runtime cannot emit glue method {0}")]
    GlueUnsupported(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Errors that describe an unsupported combination rather than a failed operation
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Error::PlatformNotSupported(_) | Error::GlueUnsupported(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::Io(io_err);
        assert!(err.is_not_found());

        let other_io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err2 = Error::Io(other_io_err);
        assert!(!err2.is_not_found());
    }

    #[test]
    fn test_error_is_unsupported() {
        assert!(Error::PlatformNotSupported("arm".to_string()).is_unsupported());
        assert!(!Error::SelfDetour { address: 0x1000 }.is_unsupported());
    }

    #[test]
    fn test_self_detour_message() {
        let err = Error::SelfDetour { address: 0x1000 };
        assert_eq!(err.to_string(), "Cannot detour 0x1000 to itself");
    }
}

// handlemem - Handle-based memory allocation
// Small chunks from slabs, big chunks from a table, external buffers by registration

#![warn(rust_2018_idioms)]

pub mod config;
pub mod memory;

// Re-exports for convenience
pub use crate::config::MemoryConfig;
pub use memory::{
    BufferProvider, Handle, HandleAllocator, HeapBufferProvider, Location, MemoryStats,
    NativeBuffer, Primitive, SharedBuffer,
};

/// handlemem error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid address: {0}")]
        InvalidAddress(String),

        #[error("Capacity exceeded: {0}")]
        CapacityExceeded(String),

        #[error("Inconsistent state: {0}")]
        InconsistentState(String),

        #[error("Usage error: {0}")]
        Usage(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl From<::config::ConfigError> for Error {
        fn from(err: ::config::ConfigError) -> Self {
            Error::Config(err.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert_eq!(VERSION.split('.').count(), 3);
    }

    #[test]
    fn test_error_display() {
        let err = error::Error::InvalidAddress("null handle".to_string());
        assert_eq!(err.to_string(), "Invalid address: null handle");
    }
}

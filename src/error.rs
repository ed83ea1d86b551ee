//! Error types shared across the search core and the command line surface.
//!
//! Fatal configuration and data errors surface through [`QSeekError`];
//! conditions that are recovered locally (a node that cannot split, a
//! travel time outside a table) use small dedicated types next to the code
//! that handles them.

use thiserror::Error;

/// Application error for the search core.
///
/// The variants follow the propagation policy of the pipeline: `Config` and
/// `Data` are fatal at startup and prepare time, `Io` is retried once for
/// persistent state and then fatal, `Table` is fatal when a travel-time
/// table cannot be built or loaded, and `Cancelled` unwinds the streaming
/// loop after a cooperative cancellation request.
#[derive(Error, Debug)]
pub enum QSeekError {
    /// Invalid or inconsistent configuration.
    #[error("config error: {message}")]
    Config { message: String },

    /// Missing or unusable input data (stations, waveforms).
    #[error("data error: {message}")]
    Data { message: String },

    /// I/O failure on persistent state (rundir, caches, exports).
    #[error("IO error: {message}")]
    Io { message: String },

    /// Travel-time table construction, persistence or lookup failure.
    #[error("travel time table error: {message}")]
    Table { message: String },

    /// Cooperative cancellation was requested.
    #[error("search cancelled")]
    Cancelled,
}

impl QSeekError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn table(message: impl Into<String>) -> Self {
        Self::Table {
            message: message.into(),
        }
    }
}

/// Convert standard IO errors into the application error type.
impl From<std::io::Error> for QSeekError {
    fn from(error: std::io::Error) -> Self {
        QSeekError::Io {
            message: error.to_string(),
        }
    }
}

/// Convert JSON (de)serialization errors into the application error type.
impl From<serde_json::Error> for QSeekError {
    fn from(error: serde_json::Error) -> Self {
        QSeekError::Io {
            message: error.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QSeekError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let app_error: QSeekError = io_error.into();

        match app_error {
            QSeekError::Io { message } => {
                assert!(message.contains("file not found"));
            }
            _ => panic!("Wrong error variant"),
        }
    }

    #[test]
    fn test_constructors() {
        let err = QSeekError::config("bad bounds");
        assert_eq!(err.to_string(), "config error: bad bounds");
    }
}

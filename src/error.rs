// MIT License - Copyright (c) 2021 TJForc
// Error types

use std::path::PathBuf;

/// Host-level faults raised by the link engine.
///
/// Protocol outcomes (silence, exhausted budgets, unparseable replies,
/// integrity rejections) are never errors; they surface as `false`/`None`
/// from the operation that observed them. This type only covers the
/// channel, staging storage and configuration failing underneath.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Invalid configuration parameter {name}: {value}")]
    InvalidParam { name: String, value: String },

    #[error("Invalid configuration file: {0}")]
    ConfigFile(String),

    #[error("Failed to stage {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LinkError {
    /// Whether this error is transient and the whole cycle may be retried
    /// on the next scheduled wake.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_) | LinkError::Serial(_) | LinkError::Staging { .. }
        )
    }
}

#[cfg(feature = "serial")]
impl From<serialport::Error> for LinkError {
    fn from(e: serialport::Error) -> Self {
        LinkError::Serial(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let io = LinkError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_retryable());
        assert!(LinkError::Serial("unplugged".into()).is_retryable());
        assert!(!LinkError::ConfigFile("bad".into()).is_retryable());
    }

    #[test]
    fn test_staging_display_includes_path() {
        let err = LinkError::Staging {
            path: PathBuf::from("/flash/main.py.new"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/flash/main.py.new"));
        assert!(msg.contains("disk full"));
    }
}

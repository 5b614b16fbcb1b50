use std::fmt;
use std::io;
use std::path::PathBuf;

/// Fatal startup errors of the driver.
#[derive(Debug)]
pub enum DriverError {
    /// Invalid configuration detected during `conclude`.
    Configuration(String),
    /// Another live driver owns the state directory.
    ActiveDriver { dir: PathBuf },
    /// Filesystem or mapping failure.
    Io(io::Error),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::ActiveDriver { dir } => {
                write!(f, "active driver detected in {}", dir.display())
            }
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

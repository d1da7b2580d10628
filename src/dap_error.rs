use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum DapError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Msg(String),
}

impl fmt::Display for DapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DapError::Io(e) => write!(f, "I/O error: {e}"),
            DapError::Json(e) => write!(f, "JSON error: {e}"),
            DapError::Msg(s) => write!(f, "{s}"),
        }
    }
}

impl Error for DapError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DapError::Io(e) => Some(e),
            DapError::Json(e) => Some(e),
            DapError::Msg(_) => None,
        }
    }
}

impl From<std::io::Error> for DapError {
    fn from(e: std::io::Error) -> Self {
        DapError::Io(e)
    }
}

impl From<serde_json::Error> for DapError {
    fn from(e: serde_json::Error) -> Self {
        DapError::Json(e)
    }
}

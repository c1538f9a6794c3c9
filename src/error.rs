use std::fmt;

#[derive(Debug)]
pub enum SortError {
    /// Row does not match the declared template.
    Shape(String),
    /// Two fields could not be compared (e.g. different types).
    Comparison(String),
    /// A caller supplied sort observer failed.
    Observer(String),
    /// Unique constraint violated by two rows with equal keys.
    DuplicateKey(String),
    Storage(String),
    Config(String),
}

impl fmt::Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortError::Shape(msg) => write!(f, "row shape mismatch: {}", msg),
            SortError::Comparison(msg) => write!(f, "comparison failed: {}", msg),
            SortError::Observer(msg) => write!(f, "sort observer failed: {}", msg),
            SortError::DuplicateKey(msg) => write!(f, "duplicate key: {}", msg),
            SortError::Storage(msg) => write!(f, "run storage: {}", msg),
            SortError::Config(msg) => write!(f, "invalid sort configuration: {}", msg),
        }
    }
}

impl std::error::Error for SortError {}

impl From<std::io::Error> for SortError {
    fn from(err: std::io::Error) -> SortError {
        SortError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for SortError {
    fn from(err: bincode::Error) -> SortError {
        SortError::Storage(format!("{:?}", err))
    }
}

use std::fmt;

#[derive(Debug)]
pub enum DataError {
    Io(std::io::Error),
    Manifest(String),
    Image(String),
    Codec(String),
    Style(String),
    Spaced(String),
    Config(String),
    Collate(String),
}

impl DataError {
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest(message.into())
    }

    pub fn image(message: impl Into<String>) -> Self {
        Self::Image(message.into())
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    pub fn style(message: impl Into<String>) -> Self {
        Self::Style(message.into())
    }

    pub fn spaced(message: impl Into<String>) -> Self {
        Self::Spaced(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn collate(message: impl Into<String>) -> Self {
        Self::Collate(message.into())
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::Io(err) => write!(f, "io error: {}", err),
            DataError::Manifest(msg) => write!(f, "manifest error: {}", msg),
            DataError::Image(msg) => write!(f, "image error: {}", msg),
            DataError::Codec(msg) => write!(f, "character codec error: {}", msg),
            DataError::Style(msg) => write!(f, "style store error: {}", msg),
            DataError::Spaced(msg) => write!(f, "spaced-label store error: {}", msg),
            DataError::Config(msg) => write!(f, "dataset configuration error: {}", msg),
            DataError::Collate(msg) => write!(f, "collation error: {}", msg),
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DataError {
    fn from(value: std::io::Error) -> Self {
        DataError::Io(value)
    }
}

use std::str::Utf8Error;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FragError>;

#[derive(Error, Debug)]
pub enum FragError {
    #[error("position {position} is out of range (extent is {extent})")]
    OutOfRange { position: u64, extent: u64 },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("no region labeled '{0}'")]
    UnknownRegion(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {status} from <{url}>")]
    HttpStatus { status: u16, url: String },
    #[error("HTTP header error: {0}")]
    HttpHeader(String),
    #[error("resource cache mismatch: {0}")]
    CacheMismatch(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::string::FromUtf8Error> for FragError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::Utf8(e.utf8_error())
    }
}

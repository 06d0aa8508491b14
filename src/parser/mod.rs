pub mod line_protocol;

use crate::sink::Point;
use thiserror::Error;

pub use line_protocol::LineProtocolParser;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("missing measurement")]
    MissingMeasurement,

    #[error("missing fields")]
    MissingFields,

    #[error("invalid tag '{0}'")]
    InvalidTag(String),

    #[error("invalid field '{0}'")]
    InvalidField(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("unexpected trailing content '{0}'")]
    TrailingContent(String),
}

/// Turns a record payload into at most one point
pub trait Parser: Send + Sync {
    /// `Ok(None)` means the payload holds nothing to write
    fn parse(&self, payload: &[u8]) -> Result<Option<Point>, ParseError>;
}

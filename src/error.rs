//! Crate-wide error type.

use std::collections::HashMap;
use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Single-byte field codes used by `ErrorResponse`/`NoticeResponse`, per the wire protocol.
pub mod field_code {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_NON_LOCALIZED: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const DATA_TYPE: u8 = b'd';
    pub const CONSTRAINT: u8 = b'n';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';
}

/// A server-reported `ErrorResponse`/`NoticeResponse`, as the raw field-code → string mapping
/// the wire protocol carries, with typed accessors over the commonly-consulted fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError(pub HashMap<u8, String>);

impl ServerError {
    pub fn get(&self, code: u8) -> Option<&str> {
        self.0.get(&code).map(String::as_str)
    }

    pub fn severity(&self) -> Option<&str> {
        self.get(field_code::SEVERITY_NON_LOCALIZED)
            .or_else(|| self.get(field_code::SEVERITY))
    }

    pub fn code(&self) -> Option<&str> {
        self.get(field_code::CODE)
    }

    pub fn message(&self) -> Option<&str> {
        self.get(field_code::MESSAGE)
    }

    pub fn detail(&self) -> Option<&str> {
        self.get(field_code::DETAIL)
    }

    pub fn hint(&self) -> Option<&str> {
        self.get(field_code::HINT)
    }

    pub fn position(&self) -> Option<&str> {
        self.get(field_code::POSITION)
    }

    pub fn where_(&self) -> Option<&str> {
        self.get(field_code::WHERE)
    }

    pub fn schema(&self) -> Option<&str> {
        self.get(field_code::SCHEMA)
    }

    pub fn table(&self) -> Option<&str> {
        self.get(field_code::TABLE)
    }

    pub fn column(&self) -> Option<&str> {
        self.get(field_code::COLUMN)
    }

    pub fn data_type(&self) -> Option<&str> {
        self.get(field_code::DATA_TYPE)
    }

    pub fn constraint(&self) -> Option<&str> {
        self.get(field_code::CONSTRAINT)
    }

    /// True for severities that mean the connection cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), Some("FATAL") | Some("PANIC"))
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.severity().unwrap_or("ERROR"),
            self.message().unwrap_or("unknown server error")
        )
    }
}

/// The crate's single error type. Every fallible operation in this driver returns one of
/// these variants; callers match on it rather than catching heterogeneous failure types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Server-reported `ErrorResponse`.
    #[error("postgres error: {0}")]
    Server(ServerError),

    /// Malformed or unexpected wire data: unknown tag, truncated frame, message out of phase.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication negotiation failed or requested a method this driver does not support.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The connection is no longer usable and must be reconnected.
    #[error("connection broken")]
    ConnectionBroken,

    /// A caller-side precondition was violated (e.g. a mutating call while not `ready`).
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// A requested feature is outside this core's scope.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A parameter could not be encoded, or a row value could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// True when the session's socket must be torn down rather than merely replied to.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionBroken | Error::Protocol(_) => true,
            Error::Server(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// The SQLSTATE code, if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(e) => e.code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_prefers_non_localized_severity() {
        let mut map = HashMap::new();
        map.insert(field_code::SEVERITY, "ERREUR".to_string());
        map.insert(field_code::SEVERITY_NON_LOCALIZED, "ERROR".to_string());
        let err = ServerError(map);
        assert_eq!(err.severity(), Some("ERROR"));
    }

    #[test]
    fn fatal_severity_marks_connection_broken() {
        let mut map = HashMap::new();
        map.insert(field_code::SEVERITY_NON_LOCALIZED, "FATAL".to_string());
        let err = Error::Server(ServerError(map));
        assert!(err.is_connection_broken());
    }

    #[test]
    fn io_error_is_connection_broken() {
        let err = Error::Io(std::io::Error::other("boom"));
        assert!(err.is_connection_broken());
    }

    #[test]
    fn decode_error_is_not_connection_broken() {
        let err = Error::Decode("bad int".into());
        assert!(!err.is_connection_broken());
    }
}

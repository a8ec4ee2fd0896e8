//! Connection options.

use std::sync::Arc;

use no_panic::no_panic;

use crate::error::Result;
use crate::protocol::types::{FormatCode, Oid};
use crate::value::Value;

/// User override for parameter encoding, consulted before the registry's own codec.
///
/// Called with `(type_name, sender, oid, default_encoder, value)`; `default_encoder` is the
/// registry's own attempt, so a hook can delegate back to it for the cases it doesn't care
/// about.
pub type Encoder =
    Arc<dyn Fn(&str, &str, Oid, &dyn Fn(&Value) -> Option<Vec<u8>>, &Value) -> Result<Option<Vec<u8>>> + Send + Sync>;

/// User override for row-value decoding, consulted before the registry's own codec.
///
/// Called with `(type_name, sender, oid, default_decoder, bytes)`.
pub type Decoder = Arc<
    dyn Fn(&str, &str, Oid, &dyn Fn(&[u8]) -> Result<Value>, &[u8]) -> Result<Value> + Send + Sync,
>;

/// User override for the result format requested per column at Bind time.
///
/// Called with `(type_name, sender, oid)`.
pub type DecodeFormatter = Arc<dyn Fn(&str, &str, Oid) -> FormatCode + Send + Sync>;

/// Behavioral overrides the caller supplies at connect time, modeled as an explicit strategy
/// object rather than as runtime monkey-patching.
#[derive(Clone, Default)]
pub struct Hooks {
    pub encoder: Option<Encoder>,
    pub decoder: Option<Decoder>,
    pub decode_formatter: Option<DecodeFormatter>,
}

/// Connection parameters accepted by [`crate::conn::Conn::connect`].
#[derive(Clone)]
pub struct Opts {
    /// Server hostname or IP address.
    pub hostname: String,
    /// Server port.
    pub port: u16,
    /// Database role to authenticate as.
    pub username: String,
    /// Database to connect to; defaults to `username` if empty.
    pub database: String,
    /// Cleartext password, used to answer whichever auth method the server requests.
    pub password: String,
    /// Extra `StartupMessage` parameters (e.g. `("application_name", "my_app")`).
    pub parameters: Vec<(String, String)>,
    /// Behavioral overrides for value encoding/decoding.
    pub hooks: Hooks,
}

impl Default for Opts {
    #[no_panic]
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 5432,
            username: String::new(),
            database: String::new(),
            password: String::new(),
            parameters: Vec::new(),
            hooks: Hooks::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_5432() {
        assert_eq!(Opts::default().port, 5432);
    }
}

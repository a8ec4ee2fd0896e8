//! Runtime type registry: maps OIDs to the send/receive functions that know how to encode and
//! decode them, built from a built-in table plus rows fetched from the server at connect time.

use std::collections::HashMap;

use crate::protocol::types::{oid, Oid};

/// One entry in the registry: a type's name and the `send` function PostgreSQL uses to produce
/// its binary wire representation. The sender name is what the built-in codecs key off of;
/// it is also what a user-supplied hook receives so it can recognize types it wants to special-
/// case without needing the OID constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub oid: Oid,
    pub name: String,
    pub sender: String,
}

/// The bootstrap query issued once per connection (as an ordinary extended-query request, not
/// a special-cased protocol path) to learn the server's type catalog beyond the built-in table.
pub const BOOTSTRAP_QUERY: &str =
    "SELECT t.oid, t.typname, p.proname FROM pg_catalog.pg_type t \
     JOIN pg_catalog.pg_proc p ON p.oid = t.typsend";

/// Scalar OIDs common enough to hardcode, available before the bootstrap query has run.
fn builtin_types() -> Vec<TypeInfo> {
    let entries: &[(Oid, &str, &str)] = &[
        (oid::BOOL, "bool", "boolsend"),
        (oid::BYTEA, "bytea", "byteasend"),
        (oid::INT8, "int8", "int8send"),
        (oid::INT2, "int2", "int2send"),
        (oid::INT4, "int4", "int4send"),
        (oid::TEXT, "text", "textsend"),
        (oid::FLOAT4, "float4", "float4send"),
        (oid::FLOAT8, "float8", "float8send"),
        (oid::VARCHAR, "varchar", "varcharsend"),
        (oid::BPCHAR, "bpchar", "bpcharsend"),
        (oid::NAME, "name", "namesend"),
    ];
    entries
        .iter()
        .map(|&(oid, name, sender)| TypeInfo {
            oid,
            name: name.to_string(),
            sender: sender.to_string(),
        })
        .collect()
}

/// The set of known types for a connection: the built-in table, overlaid with whatever the
/// bootstrap query reported. Bootstrap rows win on OID collision since they reflect the actual
/// server rather than a compiled-in guess.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    by_oid: HashMap<Oid, TypeInfo>,
}

impl Registry {
    /// A registry containing only the built-in scalar table, usable before bootstrap completes.
    pub fn with_builtins() -> Self {
        let mut by_oid = HashMap::new();
        for info in builtin_types() {
            by_oid.insert(info.oid, info);
        }
        Self { by_oid }
    }

    /// Merge bootstrap query rows `(oid, typname, proname)` into the registry, overriding any
    /// built-in entry with the same OID.
    pub fn extend_from_bootstrap(&mut self, rows: impl IntoIterator<Item = (Oid, String, String)>) {
        for (oid, typname, proname) in rows {
            self.by_oid.insert(
                oid,
                TypeInfo {
                    oid,
                    name: typname,
                    sender: proname,
                },
            );
        }
    }

    pub fn lookup(&self, oid: Oid) -> Option<&TypeInfo> {
        self.by_oid.get(&oid)
    }

    /// True if `oid` has a registered sender *and* that sender has an implemented codec —
    /// not merely a name the bootstrap query happened to report. Most of the server's type
    /// catalog (arrays, ranges, domains, `numeric`, `interval`, ...) is known by name only;
    /// those fall back to raw bytes rather than a binary decode attempt.
    pub fn can_decode(&self, oid: Oid) -> bool {
        self.by_oid
            .get(&oid)
            .is_some_and(|info| DECODABLE_SENDERS.contains(&info.sender.as_str()))
    }
}

/// Senders `value::builtin_decode_binary`/`builtin_decode_text` actually implement. Kept in
/// sync with those match arms by hand; a sender absent here is decoded as raw bytes instead.
const DECODABLE_SENDERS: &[&str] = &[
    "boolsend",
    "int2send",
    "int4send",
    "int8send",
    "float4send",
    "float8send",
    "textsend",
    "varcharsend",
    "bpcharsend",
    "namesend",
    "byteasend",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_common_scalars() {
        let registry = Registry::with_builtins();
        assert!(registry.can_decode(oid::INT4));
        assert!(registry.can_decode(oid::TEXT));
        assert!(!registry.can_decode(oid::NUMERIC));
    }

    #[test]
    fn bootstrap_rows_override_builtins() {
        let mut registry = Registry::with_builtins();
        registry.extend_from_bootstrap([(oid::INT4, "int4".to_string(), "int4send_custom".to_string())]);
        assert_eq!(registry.lookup(oid::INT4).unwrap().sender, "int4send_custom");
    }

    #[test]
    fn bootstrap_rows_add_new_types_known_by_name_only() {
        let mut registry = Registry::with_builtins();
        assert!(registry.lookup(oid::NUMERIC).is_none());
        assert!(!registry.can_decode(oid::NUMERIC));
        registry.extend_from_bootstrap([(oid::NUMERIC, "numeric".to_string(), "numeric_send".to_string())]);
        assert_eq!(registry.lookup(oid::NUMERIC).unwrap().name, "numeric");
        // `numeric_send` has no implemented codec, so it's known by name only.
        assert!(!registry.can_decode(oid::NUMERIC));
    }

    #[test]
    fn bootstrap_rows_for_an_implemented_sender_are_decodable() {
        let mut registry = Registry::with_builtins();
        registry.extend_from_bootstrap([(99999, "widget".to_string(), "int4send".to_string())]);
        assert!(registry.can_decode(99999));
    }
}

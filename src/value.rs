//! The dynamic, runtime-typed value a caller sends as a parameter and receives back as a row
//! cell, plus the encode/decode algorithms that translate it to and from wire bytes.

use simdutf8::compat::from_utf8;

use crate::error::{Error, Result};
use crate::opts::Hooks;
use crate::protocol::types::{FormatCode, Oid};
use crate::registry::Registry;

/// A host-language value. This is the only value type callers deal with; there are no
/// generated per-OID Rust types; the registry and any user hooks are what know how a given
/// OID's bytes map to one of these variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Encode `value` for a parameter of the given sender/oid, trying in order: the user's
/// encoder hook, the registry's built-in codec for that sender, then a raw-bytes fallback for
/// `Value::Bytes`. Returns `None` for SQL NULL (caller writes the wire null marker directly).
///
/// The returned `FormatCode` says how the bytes are encoded: `Binary` for the hook and
/// registry paths, `Text` for the raw-bytes fallback, since a bare `Value::Bytes` the
/// registry doesn't recognize is passed through as-is rather than binary-encoded, and the
/// server must be told so via `Bind`'s per-parameter format code.
pub fn encode_param(
    value: &Value,
    type_name: &str,
    sender: &str,
    oid: Oid,
    hooks: &Hooks,
) -> Result<Option<(FormatCode, Vec<u8>)>> {
    if matches!(value, Value::Null) {
        return Ok(None);
    }

    let default_encode = |v: &Value| -> Option<Vec<u8>> { builtin_encode(v, sender) };

    if let Some(encoder) = &hooks.encoder {
        return Ok(encoder(type_name, sender, oid, &default_encode, value)?
            .map(|bytes| (FormatCode::Binary, bytes)));
    }

    if let Some(bytes) = builtin_encode(value, sender) {
        return Ok(Some((FormatCode::Binary, bytes)));
    }

    if let Value::Bytes(raw) = value {
        return Ok(Some((FormatCode::Text, raw.clone())));
    }

    Err(Error::Decode(format!(
        "unable to encode value {:?} as type {}",
        value, type_name
    )))
}

fn builtin_encode(value: &Value, sender: &str) -> Option<Vec<u8>> {
    match (sender, value) {
        ("boolsend", Value::Bool(b)) => Some(vec![u8::from(*b)]),
        ("int2send", Value::I16(n)) => Some(n.to_be_bytes().to_vec()),
        ("int2send", Value::I32(n)) => i16::try_from(*n).ok().map(|n| n.to_be_bytes().to_vec()),
        ("int4send", Value::I16(n)) => Some(i32::from(*n).to_be_bytes().to_vec()),
        ("int4send", Value::I32(n)) => Some(n.to_be_bytes().to_vec()),
        ("int8send", Value::I16(n)) => Some(i64::from(*n).to_be_bytes().to_vec()),
        ("int8send", Value::I32(n)) => Some(i64::from(*n).to_be_bytes().to_vec()),
        ("int8send", Value::I64(n)) => Some(n.to_be_bytes().to_vec()),
        ("float4send", Value::F32(f)) => Some(f.to_be_bytes().to_vec()),
        ("float8send", Value::F32(f)) => Some(f64::from(*f).to_be_bytes().to_vec()),
        ("float8send", Value::F64(f)) => Some(f.to_be_bytes().to_vec()),
        ("textsend" | "varcharsend" | "bpcharsend" | "namesend", Value::Text(s)) => {
            Some(s.as_bytes().to_vec())
        }
        ("byteasend", Value::Bytes(b)) => Some(b.clone()),
        _ => None,
    }
}

/// Decode one column's wire bytes into a `Value`. `bytes = None` means SQL NULL. `format`
/// reflects which representation the server actually sent, matching what was negotiated at
/// Bind time via [`negotiate_result_format`].
pub fn decode_column(
    bytes: Option<&[u8]>,
    type_name: &str,
    sender: &str,
    oid: Oid,
    format: FormatCode,
    can_decode: bool,
    hooks: &Hooks,
) -> Result<Value> {
    let Some(bytes) = bytes else {
        return Ok(Value::Null);
    };

    let default_decode = |b: &[u8]| -> Result<Value> { builtin_decode(b, sender, format) };

    if let Some(decoder) = &hooks.decoder {
        return decoder(type_name, sender, oid, &default_decode, bytes);
    }

    if can_decode {
        return builtin_decode(bytes, sender, format);
    }

    Ok(Value::Bytes(bytes.to_vec()))
}

fn builtin_decode(bytes: &[u8], sender: &str, format: FormatCode) -> Result<Value> {
    match format {
        FormatCode::Binary => builtin_decode_binary(bytes, sender),
        FormatCode::Text => builtin_decode_text(bytes, sender),
    }
}

fn builtin_decode_binary(bytes: &[u8], sender: &str) -> Result<Value> {
    match sender {
        "boolsend" => Ok(Value::Bool(*bytes.first().ok_or_else(|| too_short(sender))? != 0)),
        "int2send" => Ok(Value::I16(i16::from_be_bytes(fixed(bytes, sender)?))),
        "int4send" => Ok(Value::I32(i32::from_be_bytes(fixed(bytes, sender)?))),
        "int8send" => Ok(Value::I64(i64::from_be_bytes(fixed(bytes, sender)?))),
        "float4send" => Ok(Value::F32(f32::from_be_bytes(fixed(bytes, sender)?))),
        "float8send" => Ok(Value::F64(f64::from_be_bytes(fixed(bytes, sender)?))),
        "textsend" | "varcharsend" | "bpcharsend" | "namesend" => Ok(Value::Text(
            from_utf8(bytes)
                .map_err(|e| Error::Decode(format!("invalid UTF-8: {e}")))?
                .to_string(),
        )),
        "byteasend" => Ok(Value::Bytes(bytes.to_vec())),
        _ => Err(Error::Decode(format!("no binary decoder for {sender}"))),
    }
}

fn builtin_decode_text(bytes: &[u8], sender: &str) -> Result<Value> {
    let text = from_utf8(bytes).map_err(|e| Error::Decode(format!("invalid UTF-8: {e}")))?;
    match sender {
        "boolsend" => Ok(Value::Bool(matches!(text, "t" | "true" | "TRUE"))),
        "int2send" => Ok(Value::I16(
            text.parse().map_err(|_| Error::Decode(format!("invalid int2: {text}")))?,
        )),
        "int4send" => Ok(Value::I32(
            text.parse().map_err(|_| Error::Decode(format!("invalid int4: {text}")))?,
        )),
        "int8send" => Ok(Value::I64(
            text.parse().map_err(|_| Error::Decode(format!("invalid int8: {text}")))?,
        )),
        "float4send" => Ok(Value::F32(
            text.parse().map_err(|_| Error::Decode(format!("invalid float4: {text}")))?,
        )),
        "float8send" => Ok(Value::F64(
            text.parse().map_err(|_| Error::Decode(format!("invalid float8: {text}")))?,
        )),
        "textsend" | "varcharsend" | "bpcharsend" | "namesend" => Ok(Value::Text(text.to_string())),
        "byteasend" => Ok(Value::Text(text.to_string())),
        _ => Err(Error::Decode(format!("no text decoder for {sender}"))),
    }
}

fn fixed<const N: usize>(bytes: &[u8], sender: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| too_short(sender))
}

fn too_short(sender: &str) -> Error {
    Error::Decode(format!("truncated value for {sender}"))
}

/// Decide which format to request for a column at Bind time: binary when the registry (or a
/// `decode_formatter` hook) knows how to handle the type, text otherwise — PostgreSQL always
/// supports text, so this is the unconditional fallback.
pub fn negotiate_result_format(
    registry: &Registry,
    hooks: &Hooks,
    oid: Oid,
) -> FormatCode {
    if let (Some(formatter), Some(info)) = (&hooks.decode_formatter, registry.lookup(oid)) {
        return formatter(&info.name, &info.sender, oid);
    }
    if registry.can_decode(oid) {
        FormatCode::Binary
    } else {
        FormatCode::Text
    }
}

//! The protocol engine: a single `phase`-driven state machine that serves both catalog
//! bootstrap and every subsequent extended-query request. Sans-I/O — it never touches a
//! socket, only decoded messages and caller requests in, [`Action`]s out.

use std::collections::HashMap;

use tracing::warn;

use crate::action::{Action, AsyncMessage};
use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::auth::AuthenticationMessage;
use crate::protocol::backend::query::{CommandComplete, DataRow, EmptyQueryResponse, RowDescription};
use crate::protocol::backend::{
    self as backend, BackendKeyData, BindComplete, ErrorResponse, NoData, NoticeResponse,
    ParameterDescription, ParameterStatus, ParseComplete, ReadyForQuery,
};
use crate::protocol::frontend::auth::md5_password;
use crate::protocol::frontend::{self as frontend};
use crate::protocol::types::{FormatCode, Oid};
use crate::registry::{Registry, BOOTSTRAP_QUERY};
use crate::transaction::{self, Operation};
use crate::value::{self, Value};

/// Phase of the single state machine driving both bootstrap and ordinary requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Auth,
    Init,
    Parsing,
    Describing,
    Binding,
    Executing,
}

/// What kind of request is in flight, so `CommandComplete` knows how to shape the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Connect,
    Query,
    Control,
}

/// A caller-originated request; accepted only while `phase == Ready`.
#[derive(Debug)]
pub enum Request {
    Connect,
    Query { sql: String, params: Vec<Value> },
    Begin,
    Commit,
    Rollback,
}

/// Input fed into [`ProtocolEngine::step`]: either a caller request or a decoded server message.
#[derive(Debug)]
pub enum Input<'a> {
    Request(Request),
    Message { type_byte: u8, payload: &'a [u8] },
}

/// Column metadata captured from `RowDescription`, enough to decode the `DataRow`s that follow.
#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    sender: String,
    oid: Oid,
    format: FormatCode,
}

/// The outcome of a finished request, retrieved via [`ProtocolEngine::take_result`].
#[derive(Debug)]
pub enum QueryOutcome {
    Ok,
    Result(QueryResult),
}

/// The result record shape described in the external interface: command atom, row count, and
/// the rows/columns themselves (absent for commands with no result columns).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub command: String,
    pub num_rows: u32,
    pub rows: Option<Vec<Vec<Value>>>,
    pub columns: Option<Vec<String>>,
}

/// The connection state machine and protocol engine.
pub struct ProtocolEngine {
    phase: Phase,
    opts: Opts,
    pending_kind: PendingKind,
    pending_result: Option<Result<QueryOutcome>>,
    parameters: HashMap<String, String>,
    backend_key: Option<(u32, u32)>,
    bootstrap: bool,
    types: Registry,
    transactions: u32,
    rows: Vec<Vec<Option<Vec<u8>>>>,
    columns: Vec<ColumnInfo>,
    param_oids: Vec<Oid>,
    qparams: Vec<Value>,
}

impl ProtocolEngine {
    pub fn new(opts: Opts) -> Self {
        Self {
            phase: Phase::Ready,
            opts,
            pending_kind: PendingKind::Connect,
            pending_result: None,
            parameters: HashMap::new(),
            backend_key: None,
            bootstrap: false,
            types: Registry::with_builtins(),
            transactions: 0,
            rows: Vec::new(),
            columns: Vec::new(),
            param_oids: Vec::new(),
            qparams: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn transactions(&self) -> u32 {
        self.transactions
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Take the result of the most recently finished request. `None` until a `step` call has
    /// returned `Action::Finished`.
    pub fn take_result(&mut self) -> Option<Result<QueryOutcome>> {
        self.pending_result.take()
    }

    /// Advance the engine by one caller request or one decoded server message.
    pub fn step(&mut self, buffers: &mut BufferSet, input: Input<'_>) -> Result<Action> {
        match input {
            Input::Request(request) => self.handle_request(buffers, request),
            Input::Message { type_byte, payload } => self.handle_message(buffers, type_byte, payload),
        }
    }

    fn handle_request(&mut self, buffers: &mut BufferSet, request: Request) -> Result<Action> {
        if self.phase != Phase::Ready {
            return Err(Error::InvalidUsage(
                "a request is already in flight on this connection".to_string(),
            ));
        }

        match request {
            Request::Connect => {
                self.pending_kind = PendingKind::Connect;
                buffers.write_buffer.clear();
                let mut params = vec![("user", self.opts.username.as_str())];
                let database = if self.opts.database.is_empty() {
                    self.opts.username.as_str()
                } else {
                    self.opts.database.as_str()
                };
                params.push(("database", database));
                for (name, value) in &self.opts.parameters {
                    params.push((name.as_str(), value.as_str()));
                }
                frontend::write_startup(&mut buffers.write_buffer, &params);
                self.phase = Phase::Auth;
                Ok(Action::WriteAndReadMessage)
            }
            Request::Query { sql, params } => {
                self.pending_kind = PendingKind::Query;
                self.begin_extended_query(buffers, &sql, params)
            }
            Request::Begin => self.run_transaction_op(buffers, Operation::Begin),
            Request::Commit => self.run_transaction_op(buffers, Operation::Commit),
            Request::Rollback => self.run_transaction_op(buffers, Operation::Rollback),
        }
    }

    fn run_transaction_op(&mut self, buffers: &mut BufferSet, op: Operation) -> Result<Action> {
        let (sql, new_counter) = transaction::apply(self.transactions, op);
        self.transactions = new_counter;
        match sql {
            None => {
                self.pending_result = Some(Ok(QueryOutcome::Ok));
                Ok(Action::Finished)
            }
            Some(sql) => {
                self.pending_kind = PendingKind::Control;
                self.begin_extended_query(buffers, &sql, Vec::new())
            }
        }
    }

    fn begin_extended_query(
        &mut self,
        buffers: &mut BufferSet,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Action> {
        self.bootstrap = false;
        self.qparams = params;
        self.columns.clear();
        self.param_oids.clear();
        self.rows.clear();
        buffers.write_buffer.clear();
        frontend::write_parse(&mut buffers.write_buffer, "", sql, &[]);
        frontend::write_describe_statement(&mut buffers.write_buffer, "");
        frontend::write_sync(&mut buffers.write_buffer);
        self.phase = Phase::Parsing;
        Ok(Action::WriteAndReadMessage)
    }

    fn begin_bootstrap(&mut self, buffers: &mut BufferSet) -> Result<Action> {
        self.bootstrap = true;
        self.qparams.clear();
        self.columns.clear();
        self.param_oids.clear();
        self.rows.clear();
        buffers.write_buffer.clear();
        frontend::write_parse(&mut buffers.write_buffer, "", BOOTSTRAP_QUERY, &[]);
        frontend::write_describe_statement(&mut buffers.write_buffer, "");
        frontend::write_sync(&mut buffers.write_buffer);
        self.phase = Phase::Parsing;
        Ok(Action::WriteAndReadMessage)
    }

    fn handle_message(&mut self, buffers: &mut BufferSet, type_byte: u8, payload: &[u8]) -> Result<Action> {
        use backend::msg_type;

        if type_byte == msg_type::PARAMETER_STATUS {
            let status = ParameterStatus::parse(payload)?;
            self.parameters
                .insert(status.name.to_string(), status.value.to_string());
            return Ok(Action::HandleAsyncMessageAndReadMessage(
                AsyncMessage::ParameterChanged {
                    name: status.name.to_string(),
                    value: status.value.to_string(),
                },
            ));
        }

        if type_byte == msg_type::NOTICE_RESPONSE {
            let notice = NoticeResponse::parse(payload)?;
            warn!(
                severity = notice.fields.severity().unwrap_or("?"),
                message = notice.fields.message().unwrap_or(""),
                "server notice"
            );
            return Ok(Action::ReadMessage);
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            let err = ErrorResponse::parse(payload)?.into_error();
            let terminal = matches!(self.phase, Phase::Auth | Phase::Init);
            if self.pending_result.is_some() {
                // A reply is already stashed (e.g. a decode failure mid-result); there is no
                // `reply_to` left for this one, so it's logged and otherwise dropped.
                warn!(error = %err, "error response arrived after a reply was already stashed");
            } else {
                self.pending_result = Some(Err(err));
            }
            return if terminal {
                Ok(Action::Finished)
            } else {
                Ok(Action::ReadMessage)
            };
        }

        if type_byte == msg_type::READY_FOR_QUERY {
            let rfq = ReadyForQuery::parse(payload)?;
            let _ = rfq.transaction_status();
            return self.handle_ready_for_query(buffers);
        }

        match self.phase {
            Phase::Auth => self.handle_auth_message(buffers, type_byte, payload),
            Phase::Init => self.handle_init_message(type_byte, payload),
            Phase::Parsing => self.handle_parsing_message(type_byte, payload),
            Phase::Describing => self.handle_describing_message(buffers, type_byte, payload),
            Phase::Binding => self.handle_binding_message(type_byte, payload),
            Phase::Executing => self.handle_executing_message(type_byte, payload),
            Phase::Ready => Err(Error::Protocol(format!(
                "unexpected message {:#x} while ready",
                type_byte
            ))),
        }
    }

    fn handle_ready_for_query(&mut self, buffers: &mut BufferSet) -> Result<Action> {
        if self.pending_result.is_some() {
            self.phase = Phase::Ready;
            return Ok(Action::Finished);
        }

        match self.phase {
            Phase::Init => self.begin_bootstrap(buffers),
            Phase::Describing => {
                self.phase = Phase::Binding;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "unexpected ReadyForQuery in phase {other:?}"
            ))),
        }
    }

    fn handle_auth_message(&mut self, buffers: &mut BufferSet, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if type_byte != backend::msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "unexpected message {:#x} during authentication",
                type_byte
            )));
        }

        match AuthenticationMessage::parse(payload)? {
            AuthenticationMessage::Ok => {
                self.phase = Phase::Init;
                Ok(Action::ReadMessage)
            }
            AuthenticationMessage::CleartextPassword => {
                buffers.write_buffer.clear();
                frontend::write_password(&mut buffers.write_buffer, &self.opts.password);
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.opts.username, &self.opts.password, &salt);
                buffers.write_buffer.clear();
                frontend::write_password(&mut buffers.write_buffer, &hashed);
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Other(code) => Err(Error::Auth(format!(
                "unsupported authentication method {code}"
            ))),
        }
    }

    fn handle_init_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if type_byte == backend::msg_type::BACKEND_KEY_DATA {
            let key_data = BackendKeyData::parse(payload)?;
            self.backend_key = Some((key_data.process_id(), key_data.secret()));
            return Ok(Action::ReadMessage);
        }
        Err(Error::Protocol(format!(
            "unexpected message {:#x} during init",
            type_byte
        )))
    }

    fn handle_parsing_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if type_byte == backend::msg_type::PARSE_COMPLETE {
            let _parse_complete = ParseComplete::parse(payload)?;
            self.phase = Phase::Describing;
            return Ok(Action::ReadMessage);
        }
        Err(Error::Protocol(format!(
            "unexpected message {:#x} while parsing",
            type_byte
        )))
    }

    fn handle_describing_message(
        &mut self,
        buffers: &mut BufferSet,
        type_byte: u8,
        payload: &[u8],
    ) -> Result<Action> {
        match type_byte {
            backend::msg_type::PARAMETER_DESCRIPTION => {
                let description = ParameterDescription::parse(payload)?;
                self.param_oids = description.oids().to_vec();
                Ok(Action::ReadMessage)
            }
            backend::msg_type::ROW_DESCRIPTION => {
                let description = RowDescription::parse(payload)?;
                let columns = description
                    .iter()
                    .map(|field| self.column_info(field.name, field.type_oid()))
                    .collect();
                self.columns = columns;
                self.try_send_bind(buffers)
            }
            backend::msg_type::NO_DATA => {
                let _ = NoData::parse(payload)?;
                self.columns.clear();
                self.try_send_bind(buffers)
            }
            _ => Err(Error::Protocol(format!(
                "unexpected message {:#x} while describing",
                type_byte
            ))),
        }
    }

    fn column_info(&self, name: &str, oid: Oid) -> ColumnInfo {
        let format = if self.bootstrap {
            FormatCode::Text
        } else {
            value::negotiate_result_format(&self.types, &self.opts.hooks, oid)
        };
        let sender = self
            .types
            .lookup(oid)
            .map(|info| info.sender.clone())
            .unwrap_or_default();
        ColumnInfo {
            name: name.to_string(),
            sender,
            oid,
            format,
        }
    }

    /// Attempt to bind and execute. A parameter-count or value-encoding failure here must not
    /// abort the request: the Parse/Describe batch's `Sync` already has a `ReadyForQuery` in
    /// flight on the wire, so we stash the error as the reply and keep reading for it instead
    /// of sending Bind/Execute/Sync at all.
    fn try_send_bind(&mut self, buffers: &mut BufferSet) -> Result<Action> {
        match self.send_bind(buffers) {
            Ok(action) => Ok(action),
            Err(err) => {
                self.pending_result = Some(Err(err));
                Ok(Action::ReadMessage)
            }
        }
    }

    fn send_bind(&mut self, buffers: &mut BufferSet) -> Result<Action> {
        if self.qparams.len() != self.param_oids.len() {
            return Err(Error::InvalidUsage(format!(
                "expected {} parameters, got {}",
                self.param_oids.len(),
                self.qparams.len()
            )));
        }

        let mut encoded = Vec::with_capacity(self.qparams.len());
        for (value, &oid) in self.qparams.iter().zip(&self.param_oids) {
            let info = self.types.lookup(oid);
            let type_name = info.map(|i| i.name.as_str()).unwrap_or("unknown");
            let sender = info.map(|i| i.sender.as_str()).unwrap_or("");
            match value::encode_param(value, type_name, sender, oid, &self.opts.hooks)? {
                Some((format, bytes)) => encoded.push((format, Some(bytes))),
                None => encoded.push((FormatCode::Binary, None)),
            }
        }

        let result_formats: Vec<FormatCode> = self.columns.iter().map(|c| c.format).collect();

        buffers.write_buffer.clear();
        frontend::write_bind(&mut buffers.write_buffer, "", "", &encoded, &result_formats);
        frontend::write_execute(&mut buffers.write_buffer, "", 0);
        frontend::write_sync(&mut buffers.write_buffer);
        Ok(Action::WriteAndReadMessage)
    }

    fn handle_binding_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        if type_byte == backend::msg_type::BIND_COMPLETE {
            let _bind_complete = BindComplete::parse(payload)?;
            self.phase = Phase::Executing;
            return Ok(Action::ReadMessage);
        }
        Err(Error::Protocol(format!(
            "unexpected message {:#x} while binding",
            type_byte
        )))
    }

    fn handle_executing_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        match type_byte {
            backend::msg_type::DATA_ROW => {
                // A malformed row must not abort the request outright via `?`: the session
                // still has to read through to the next `ReadyForQuery` before it can serve
                // another request, so the failure is stashed and reading continues, same as a
                // decode failure caught later in `finish_command`.
                match DataRow::parse(payload).and_then(|row| {
                    row.iter()
                        .map(|v| v.map(|opt| opt.map(<[u8]>::to_vec)))
                        .collect::<Result<Vec<_>>>()
                }) {
                    Ok(values) => self.rows.push(values),
                    Err(err) => self.pending_result = Some(Err(err)),
                }
                Ok(Action::ReadMessage)
            }
            backend::msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                self.finish_command(complete)
            }
            backend::msg_type::EMPTY_QUERY_RESPONSE => {
                let _ = EmptyQueryResponse::parse(payload)?;
                self.pending_result = Some(Ok(QueryOutcome::Result(QueryResult {
                    command: String::new(),
                    num_rows: 0,
                    rows: None,
                    columns: None,
                })));
                self.rows.clear();
                Ok(Action::ReadMessage)
            }
            _ => Err(Error::Protocol(format!(
                "unexpected message {:#x} while executing",
                type_byte
            ))),
        }
    }

    fn finish_command(&mut self, complete: CommandComplete<'_>) -> Result<Action> {
        // A row earlier in this result already failed (e.g. a truncated `DataRow`); that
        // error is the reply, and `CommandComplete` must not overwrite it.
        if matches!(self.pending_result, Some(Err(_))) {
            self.rows.clear();
            return Ok(Action::ReadMessage);
        }

        let (command, row_count) = complete.decode_tag();

        if self.bootstrap {
            let rows = std::mem::take(&mut self.rows);
            let parsed = rows
                .into_iter()
                .map(|row| parse_bootstrap_row(&row))
                .collect::<Result<Vec<_>>>()?;
            self.types.extend_from_bootstrap(parsed);
            self.pending_result = Some(Ok(QueryOutcome::Ok));
            self.bootstrap = false;
            return Ok(Action::ReadMessage);
        }

        if self.pending_kind == PendingKind::Control {
            self.rows.clear();
            self.pending_result = Some(Ok(QueryOutcome::Ok));
            return Ok(Action::ReadMessage);
        }

        let num_rows = row_count.unwrap_or(self.rows.len() as u64) as u32;
        let (rows, columns) = if self.columns.is_empty() {
            (None, None)
        } else {
            // A decoder failure here must not abort the request outright: the reply becomes
            // the error, but the session still has to read through to the next
            // `ReadyForQuery` before it can serve another request, so we return `ReadMessage`
            // rather than propagating the error out of `step` via `?`.
            match self.rows.iter().map(|row| self.decode_row(row)).collect::<Result<Vec<_>>>() {
                Ok(decoded) => {
                    let names = self.columns.iter().map(|c| c.name.clone()).collect();
                    (Some(decoded), Some(names))
                }
                Err(err) => {
                    self.pending_result = Some(Err(err));
                    return Ok(Action::ReadMessage);
                }
            }
        };

        self.rows.clear();
        self.pending_result = Some(Ok(QueryOutcome::Result(QueryResult {
            command,
            num_rows,
            rows,
            columns,
        })));
        Ok(Action::ReadMessage)
    }

    fn decode_row(&self, row: &[Option<Vec<u8>>]) -> Result<Vec<Value>> {
        row.iter()
            .zip(&self.columns)
            .map(|(bytes, info)| {
                let type_name = self
                    .types
                    .lookup(info.oid)
                    .map(|i| i.name.as_str())
                    .unwrap_or("unknown");
                value::decode_column(
                    bytes.as_deref(),
                    type_name,
                    &info.sender,
                    info.oid,
                    info.format,
                    self.types.can_decode(info.oid),
                    &self.opts.hooks,
                )
            })
            .collect()
    }
}

fn parse_bootstrap_row(row: &[Option<Vec<u8>>]) -> Result<(Oid, String, String)> {
    let oid_bytes = row
        .first()
        .and_then(|b| b.as_deref())
        .ok_or_else(|| Error::Protocol("bootstrap row missing oid column".to_string()))?;
    let typname = row
        .get(1)
        .and_then(|b| b.as_deref())
        .ok_or_else(|| Error::Protocol("bootstrap row missing typname column".to_string()))?;
    let proname = row
        .get(2)
        .and_then(|b| b.as_deref())
        .ok_or_else(|| Error::Protocol("bootstrap row missing proname column".to_string()))?;

    let oid_text = std::str::from_utf8(oid_bytes)
        .map_err(|e| Error::Protocol(format!("bootstrap oid not UTF-8: {e}")))?;
    let oid: Oid = oid_text
        .parse()
        .map_err(|_| Error::Protocol(format!("bootstrap oid not numeric: {oid_text}")))?;
    let typname = std::str::from_utf8(typname)
        .map_err(|e| Error::Protocol(format!("bootstrap typname not UTF-8: {e}")))?
        .to_string();
    let proname = std::str::from_utf8(proname)
        .map_err(|e| Error::Protocol(format!("bootstrap proname not UTF-8: {e}")))?
        .to_string();

    Ok((oid, typname, proname))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;

    fn opts() -> Opts {
        Opts {
            hostname: "localhost".to_string(),
            username: "alice".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        }
    }

    fn cstr(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    fn msg_authentication_ok() -> Vec<u8> {
        0i32.to_be_bytes().to_vec()
    }

    fn msg_authentication_md5(salt: [u8; 4]) -> Vec<u8> {
        let mut v = 5i32.to_be_bytes().to_vec();
        v.extend_from_slice(&salt);
        v
    }

    fn msg_backend_key_data(pid: u32, secret: u32) -> Vec<u8> {
        let mut v = pid.to_be_bytes().to_vec();
        v.extend_from_slice(&secret.to_be_bytes());
        v
    }

    fn msg_parameter_status(name: &str, value: &str) -> Vec<u8> {
        let mut v = cstr(name);
        v.extend_from_slice(&cstr(value));
        v
    }

    fn msg_ready_for_query(status: u8) -> Vec<u8> {
        vec![status]
    }

    fn msg_parameter_description(oids: &[Oid]) -> Vec<u8> {
        let mut v = (oids.len() as u16).to_be_bytes().to_vec();
        for o in oids {
            v.extend_from_slice(&o.to_be_bytes());
        }
        v
    }

    fn msg_row_description(fields: &[(&str, Oid)]) -> Vec<u8> {
        let mut v = (fields.len() as u16).to_be_bytes().to_vec();
        for (name, type_oid) in fields {
            v.extend_from_slice(&cstr(name));
            v.extend_from_slice(&0u32.to_be_bytes()); // table_oid
            v.extend_from_slice(&0i16.to_be_bytes()); // column_id
            v.extend_from_slice(&type_oid.to_be_bytes());
            v.extend_from_slice(&(-1i16).to_be_bytes()); // type_size
            v.extend_from_slice(&0i32.to_be_bytes()); // type_modifier
            v.extend_from_slice(&0u16.to_be_bytes()); // format, ignored by the engine
        }
        v
    }

    fn msg_data_row(values: &[Option<&[u8]>]) -> Vec<u8> {
        let mut v = (values.len() as u16).to_be_bytes().to_vec();
        for value in values {
            match value {
                None => v.extend_from_slice(&(-1i32).to_be_bytes()),
                Some(bytes) => {
                    v.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    v.extend_from_slice(bytes);
                }
            }
        }
        v
    }

    fn msg_command_complete(tag: &str) -> Vec<u8> {
        cstr(tag)
    }

    /// Drive `engine` through authentication and catalog bootstrap against a fabricated server
    /// with a single bootstrap row (oid 99999, typname "widget", proname "widgetsend"), ending
    /// in `Phase::Ready`.
    fn connect_and_bootstrap(engine: &mut ProtocolEngine, buffers: &mut BufferSet) {
        engine.step(buffers, Input::Request(Request::Connect)).unwrap();
        let action = engine
            .step(
                buffers,
                Input::Message { type_byte: backend::msg_type::AUTHENTICATION, payload: &msg_authentication_ok() },
            )
            .unwrap();
        assert!(matches!(action, Action::ReadMessage));
        engine
            .step(
                buffers,
                Input::Message {
                    type_byte: backend::msg_type::BACKEND_KEY_DATA,
                    payload: &msg_backend_key_data(1, 2),
                },
            )
            .unwrap();
        engine
            .step(
                buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        engine
            .step(buffers, Input::Message { type_byte: backend::msg_type::PARSE_COMPLETE, payload: &[] })
            .unwrap();
        engine
            .step(
                buffers,
                Input::Message {
                    type_byte: backend::msg_type::PARAMETER_DESCRIPTION,
                    payload: &msg_parameter_description(&[]),
                },
            )
            .unwrap();
        engine
            .step(
                buffers,
                Input::Message {
                    type_byte: backend::msg_type::ROW_DESCRIPTION,
                    payload: &msg_row_description(&[("oid", 26), ("typname", 19), ("proname", 19)]),
                },
            )
            .unwrap();
        engine
            .step(
                buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        engine
            .step(buffers, Input::Message { type_byte: backend::msg_type::BIND_COMPLETE, payload: &[] })
            .unwrap();
        engine
            .step(
                buffers,
                Input::Message {
                    type_byte: backend::msg_type::DATA_ROW,
                    payload: &msg_data_row(&[
                        Some(&b"99999"[..]),
                        Some(&b"widget"[..]),
                        Some(&b"widgetsend"[..]),
                    ]),
                },
            )
            .unwrap();
        engine
            .step(
                buffers,
                Input::Message {
                    type_byte: backend::msg_type::COMMAND_COMPLETE,
                    payload: &msg_command_complete("SELECT 1"),
                },
            )
            .unwrap();
        let action = engine
            .step(
                buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::Finished));
        assert!(matches!(engine.take_result(), Some(Ok(QueryOutcome::Ok))));
        assert_eq!(engine.phase(), Phase::Ready);
    }

    #[test]
    fn md5_auth_sends_expected_password_bytes() {
        let mut engine = ProtocolEngine::new(opts());
        let mut buffers = BufferSet::new();
        engine
            .step(&mut buffers, Input::Request(Request::Connect))
            .unwrap();

        let salt = [0x12, 0x34, 0x56, 0x78];
        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::AUTHENTICATION,
                    payload: &msg_authentication_md5(salt),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::WriteAndReadMessage));

        let mut expected = Vec::new();
        let hashed = md5_password("alice", "secret", &salt);
        frontend::write_password(&mut expected, &hashed);
        assert_eq!(buffers.write_buffer, expected);
        assert_eq!(engine.phase(), Phase::Auth);
    }

    #[test]
    fn auth_error_response_is_terminal() {
        let mut engine = ProtocolEngine::new(opts());
        let mut buffers = BufferSet::new();
        engine
            .step(&mut buffers, Input::Request(Request::Connect))
            .unwrap();

        let fields = [(b'S', "FATAL"), (b'M', "password authentication failed")];
        let mut payload = Vec::new();
        for (code, text) in fields {
            payload.push(code);
            payload.extend_from_slice(&cstr(text));
        }
        payload.push(0);

        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::ERROR_RESPONSE,
                    payload: &payload,
                },
            )
            .unwrap();
        assert!(matches!(action, Action::Finished));
        match engine.take_result() {
            Some(Err(Error::Server(e))) => assert_eq!(e.message(), Some("password authentication failed")),
            other => panic!("expected a server error, got {other:?}"),
        }
    }

    #[test]
    fn simple_select_round_trip_decodes_rows() {
        let mut engine = ProtocolEngine::new(opts());
        let mut buffers = BufferSet::new();
        connect_and_bootstrap(&mut engine, &mut buffers);

        engine
            .step(
                &mut buffers,
                Input::Request(Request::Query {
                    sql: "SELECT 1::int4".to_string(),
                    params: Vec::new(),
                }),
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::PARSE_COMPLETE, payload: &[] },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::PARAMETER_DESCRIPTION,
                    payload: &msg_parameter_description(&[]),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::ROW_DESCRIPTION,
                    payload: &msg_row_description(&[("int4", oid::INT4)]),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::BIND_COMPLETE, payload: &[] },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::DATA_ROW,
                    payload: &msg_data_row(&[Some(&1i32.to_be_bytes())]),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::COMMAND_COMPLETE,
                    payload: &msg_command_complete("SELECT 1"),
                },
            )
            .unwrap();
        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::Finished));

        let result = match engine.take_result() {
            Some(Ok(QueryOutcome::Result(r))) => r,
            other => panic!("expected a result, got {other:?}"),
        };
        assert_eq!(result.command, "select");
        assert_eq!(result.num_rows, 1);
        assert_eq!(result.rows, Some(vec![vec![Value::I32(1)]]));
        assert_eq!(result.columns, Some(vec!["int4".to_string()]));
        assert_eq!(engine.phase(), Phase::Ready);
    }

    #[test]
    fn decode_failure_mid_result_returns_to_ready() {
        let mut engine = ProtocolEngine::new(opts());
        let mut buffers = BufferSet::new();
        connect_and_bootstrap(&mut engine, &mut buffers);

        engine
            .step(
                &mut buffers,
                Input::Request(Request::Query { sql: "SELECT 1::int4".to_string(), params: Vec::new() }),
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::PARSE_COMPLETE, payload: &[] },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::PARAMETER_DESCRIPTION,
                    payload: &msg_parameter_description(&[]),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::ROW_DESCRIPTION,
                    payload: &msg_row_description(&[("int4", oid::INT4)]),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::BIND_COMPLETE, payload: &[] },
            )
            .unwrap();
        // A malformed int4 (2 bytes instead of 4) fails to decode.
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::DATA_ROW,
                    payload: &msg_data_row(&[Some(&[0u8, 1])]),
                },
            )
            .unwrap();
        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::COMMAND_COMPLETE,
                    payload: &msg_command_complete("SELECT 1"),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::ReadMessage));

        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::Finished));
        match engine.take_result() {
            Some(Err(Error::Decode(_))) => {}
            other => panic!("expected a decode error, got {other:?}"),
        }
        assert_eq!(engine.phase(), Phase::Ready);
    }

    #[test]
    fn truncated_data_row_returns_to_ready() {
        let mut engine = ProtocolEngine::new(opts());
        let mut buffers = BufferSet::new();
        connect_and_bootstrap(&mut engine, &mut buffers);

        engine
            .step(
                &mut buffers,
                Input::Request(Request::Query { sql: "SELECT 1::int4".to_string(), params: Vec::new() }),
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::PARSE_COMPLETE, payload: &[] },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::PARAMETER_DESCRIPTION,
                    payload: &msg_parameter_description(&[]),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::ROW_DESCRIPTION,
                    payload: &msg_row_description(&[("int4", oid::INT4)]),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::BIND_COMPLETE, payload: &[] },
            )
            .unwrap();

        // A column declaring one byte but supplying none: a protocol error, not a short row.
        let mut payload = 1u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&1i32.to_be_bytes());
        let action = engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::DATA_ROW, payload: &payload },
            )
            .unwrap();
        assert!(matches!(action, Action::ReadMessage));

        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::COMMAND_COMPLETE,
                    payload: &msg_command_complete("SELECT 1"),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::ReadMessage));

        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::Finished));
        match engine.take_result() {
            Some(Err(Error::Protocol(_))) => {}
            other => panic!("expected a protocol error, got {other:?}"),
        }
        assert_eq!(engine.phase(), Phase::Ready);
    }

    #[test]
    fn empty_query_returns_empty_result() {
        let mut engine = ProtocolEngine::new(opts());
        let mut buffers = BufferSet::new();
        connect_and_bootstrap(&mut engine, &mut buffers);

        engine
            .step(
                &mut buffers,
                Input::Request(Request::Query { sql: String::new(), params: Vec::new() }),
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::PARSE_COMPLETE, payload: &[] },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::PARAMETER_DESCRIPTION,
                    payload: &msg_parameter_description(&[]),
                },
            )
            .unwrap();
        engine
            .step(&mut buffers, Input::Message { type_byte: backend::msg_type::NO_DATA, payload: &[] })
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::BIND_COMPLETE, payload: &[] },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::EMPTY_QUERY_RESPONSE, payload: &[] },
            )
            .unwrap();
        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::Finished));

        let result = match engine.take_result() {
            Some(Ok(QueryOutcome::Result(r))) => r,
            other => panic!("expected a result, got {other:?}"),
        };
        assert_eq!(result.num_rows, 0);
        assert_eq!(result.rows, None);
        assert_eq!(result.columns, None);
        assert_eq!(engine.phase(), Phase::Ready);
    }

    #[test]
    fn parameter_encoding_failure_returns_to_ready() {
        let mut engine = ProtocolEngine::new(opts());
        let mut buffers = BufferSet::new();
        connect_and_bootstrap(&mut engine, &mut buffers);

        engine
            .step(
                &mut buffers,
                Input::Request(Request::Query {
                    sql: "SELECT $1::int4".to_string(),
                    params: vec![Value::Bool(true)],
                }),
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message { type_byte: backend::msg_type::PARSE_COMPLETE, payload: &[] },
            )
            .unwrap();
        engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::PARAMETER_DESCRIPTION,
                    payload: &msg_parameter_description(&[oid::INT4]),
                },
            )
            .unwrap();
        // RowDescription arrives; encoding the bool parameter as int4 fails, so Bind is never
        // sent and the error is stashed instead of propagating out of `step`.
        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::ROW_DESCRIPTION,
                    payload: &msg_row_description(&[("int4", oid::INT4)]),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::ReadMessage));

        // The leftover ReadyForQuery from the Parse/Describe batch's Sync finalizes the reply
        // and returns the session to `ready`.
        let action = engine
            .step(
                &mut buffers,
                Input::Message {
                    type_byte: backend::msg_type::READY_FOR_QUERY,
                    payload: &msg_ready_for_query(b'I'),
                },
            )
            .unwrap();
        assert!(matches!(action, Action::Finished));
        match engine.take_result() {
            Some(Err(Error::Decode(msg))) => assert!(msg.contains("int4")),
            other => panic!("expected a decode error, got {other:?}"),
        }
        assert_eq!(engine.phase(), Phase::Ready);

        // The next query on the same engine proceeds normally.
        let action = engine
            .step(
                &mut buffers,
                Input::Request(Request::Query {
                    sql: "SELECT 1::int4".to_string(),
                    params: Vec::new(),
                }),
            )
            .unwrap();
        assert!(matches!(action, Action::WriteAndReadMessage));
        assert_eq!(engine.phase(), Phase::Parsing);
    }

    #[test]
    fn nested_transaction_sequence_issues_expected_sql() {
        let mut engine = ProtocolEngine::new(opts());
        let mut buffers = BufferSet::new();
        connect_and_bootstrap(&mut engine, &mut buffers);

        let run_control = |engine: &mut ProtocolEngine, buffers: &mut BufferSet, request: Request| {
            engine.step(buffers, Input::Request(request)).unwrap();
            engine
                .step(buffers, Input::Message { type_byte: backend::msg_type::PARSE_COMPLETE, payload: &[] })
                .unwrap();
            engine
                .step(
                    buffers,
                    Input::Message {
                        type_byte: backend::msg_type::PARAMETER_DESCRIPTION,
                        payload: &msg_parameter_description(&[]),
                    },
                )
                .unwrap();
            engine
                .step(buffers, Input::Message { type_byte: backend::msg_type::NO_DATA, payload: &[] })
                .unwrap();
            engine
                .step(
                    buffers,
                    Input::Message {
                        type_byte: backend::msg_type::READY_FOR_QUERY,
                        payload: &msg_ready_for_query(b'T'),
                    },
                )
                .unwrap();
            engine
                .step(buffers, Input::Message { type_byte: backend::msg_type::BIND_COMPLETE, payload: &[] })
                .unwrap();
            engine
                .step(
                    buffers,
                    Input::Message {
                        type_byte: backend::msg_type::COMMAND_COMPLETE,
                        payload: &msg_command_complete("BEGIN"),
                    },
                )
                .unwrap();
            engine
                .step(
                    buffers,
                    Input::Message {
                        type_byte: backend::msg_type::READY_FOR_QUERY,
                        payload: &msg_ready_for_query(b'T'),
                    },
                )
                .unwrap();
            assert!(matches!(engine.take_result(), Some(Ok(QueryOutcome::Ok))));
        };

        run_control(&mut engine, &mut buffers, Request::Begin);
        assert_eq!(engine.transactions(), 1);
        run_control(&mut engine, &mut buffers, Request::Begin);
        assert_eq!(engine.transactions(), 2);
        run_control(&mut engine, &mut buffers, Request::Rollback);
        assert_eq!(engine.transactions(), 1);
        run_control(&mut engine, &mut buffers, Request::Commit);
        assert_eq!(engine.transactions(), 0);
        assert_eq!(engine.phase(), Phase::Ready);
    }
}

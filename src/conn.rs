//! The single-owner request actor: a socket, the scratch buffers it reads and writes into,
//! and the protocol engine driving both. One `Conn` per server session; nothing here is
//! shared across threads.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;

use tracing::{debug, warn};

use crate::action::Action;
use crate::buffer_pool::{PooledBufferSet, GLOBAL_BUFFER_POOL};
use crate::buffer_set::BufferSet;
use crate::engine::{ProtocolEngine, QueryOutcome, QueryResult, Request};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::frontend::write_terminate;
use crate::value::Value;

/// Read one framed message (type byte + length-prefixed payload) into `buffers`.
///
/// Generic over `Read` so the frame-reassembly logic can be driven by a test source that
/// hands back arbitrarily small chunks, not just a live `TcpStream`.
fn read_message_into<R: Read>(reader: &mut R, buffers: &mut BufferSet) -> Result<()> {
    let mut type_byte = [0u8; 1];
    reader.read_exact(&mut type_byte)?;
    buffers.type_byte = type_byte[0];

    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes)?;
    let length = i32::from_be_bytes(length_bytes);
    if length < 4 {
        return Err(Error::Protocol(format!("invalid message length: {length}")));
    }

    let payload_len = length as usize - 4;
    buffers.read_buffer.clear();
    buffers.read_buffer.resize(payload_len, 0);
    reader.read_exact(&mut buffers.read_buffer)?;
    Ok(())
}

/// A live connection to a PostgreSQL server: one socket, one [`ProtocolEngine`], driven
/// synchronously to completion for every request.
pub struct Conn {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    buffers: PooledBufferSet,
    engine: ProtocolEngine,
    is_broken: bool,
}

impl Conn {
    /// Open a TCP connection and complete the authentication + bootstrap sequence.
    pub fn connect(opts: Opts) -> Result<Self> {
        let addr = format!("{}:{}", opts.hostname, opts.port);
        let stream = TcpStream::connect(&addr)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);

        let mut conn = Self {
            reader,
            writer,
            buffers: GLOBAL_BUFFER_POOL.get_buffer_set(),
            engine: ProtocolEngine::new(opts),
            is_broken: false,
        };

        conn.drive(Request::Connect)?;
        debug!("connection established");
        Ok(conn)
    }

    /// Run an extended-query request and return its result.
    pub fn query(&mut self, sql: &str, params: Vec<Value>) -> Result<QueryResult> {
        match self.drive(Request::Query {
            sql: sql.to_string(),
            params,
        })? {
            QueryOutcome::Result(result) => Ok(result),
            QueryOutcome::Ok => Err(Error::Protocol(
                "query completed without a result record".to_string(),
            )),
        }
    }

    /// Currently known server runtime parameters (`ParameterStatus` reports accumulated so far).
    pub fn parameters(&self) -> &std::collections::HashMap<String, String> {
        self.engine.parameters()
    }

    /// Open a transaction or push a savepoint, depending on current nesting depth.
    pub fn begin(&mut self) -> Result<()> {
        self.run_control(Request::Begin)
    }

    /// Commit the outermost transaction, or pop one level of nesting.
    pub fn commit(&mut self) -> Result<()> {
        self.run_control(Request::Commit)
    }

    /// Roll back the outermost transaction, or roll back to the enclosing savepoint.
    pub fn rollback(&mut self) -> Result<()> {
        self.run_control(Request::Rollback)
    }

    /// Run `f` inside `begin`/`commit`; any error from `f` rolls back and is re-raised.
    pub fn in_transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!(error = %rollback_err, "rollback after failed transaction body also failed");
                }
                Err(err)
            }
        }
    }

    /// Gracefully terminate the session.
    pub fn close(mut self) -> Result<()> {
        self.send_terminate()
    }

    fn run_control(&mut self, request: Request) -> Result<()> {
        match self.drive(request)? {
            QueryOutcome::Ok => Ok(()),
            QueryOutcome::Result(_) => Err(Error::Protocol(
                "transaction control command unexpectedly returned a result set".to_string(),
            )),
        }
    }

    fn drive(&mut self, request: Request) -> Result<QueryOutcome> {
        let result = self.drive_inner(request);
        if let Err(ref err) = result {
            if err.is_connection_broken() {
                self.is_broken = true;
            }
        }
        result
    }

    fn drive_inner(&mut self, request: Request) -> Result<QueryOutcome> {
        if self.is_broken {
            return Err(Error::ConnectionBroken);
        }

        let mut action = self
            .engine
            .step(&mut self.buffers, crate::engine::Input::Request(request))?;

        loop {
            action = match action {
                Action::WriteAndReadMessage => {
                    self.write_pending()?;
                    read_message_into(&mut self.reader, &mut self.buffers)?;
                    self.step_with_message()?
                }
                Action::Write => {
                    self.write_pending()?;
                    read_message_into(&mut self.reader, &mut self.buffers)?;
                    self.step_with_message()?
                }
                Action::ReadMessage => {
                    read_message_into(&mut self.reader, &mut self.buffers)?;
                    self.step_with_message()?
                }
                Action::HandleAsyncMessageAndReadMessage(message) => {
                    debug!(?message, "async message from server");
                    read_message_into(&mut self.reader, &mut self.buffers)?;
                    self.step_with_message()?
                }
                Action::Finished => {
                    return self
                        .engine
                        .take_result()
                        .unwrap_or(Err(Error::Protocol("engine finished with no result".to_string())));
                }
            };
        }
    }

    fn step_with_message(&mut self) -> Result<Action> {
        let type_byte = self.buffers.type_byte;
        let payload = std::mem::take(&mut self.buffers.read_buffer);
        let action = self.engine.step(
            &mut self.buffers,
            crate::engine::Input::Message {
                type_byte,
                payload: &payload,
            },
        );
        self.buffers.read_buffer = payload;
        action
    }

    fn write_pending(&mut self) -> Result<()> {
        self.writer.write_all(&self.buffers.write_buffer)?;
        self.writer.flush()?;
        Ok(())
    }

    fn send_terminate(&mut self) -> Result<()> {
        self.buffers.write_buffer.clear();
        write_terminate(&mut self.buffers.write_buffer);
        self.writer.write_all(&self.buffers.write_buffer)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        let _ = self.send_terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Input;
    use crate::opts::Opts;

    /// A `Read` source that hands back bytes in a fixed sequence of chunk sizes, regardless
    /// of how much the caller asked for, so `read_exact`'s internal retry loop is exercised.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk_sizes: Vec<usize>,
        next_chunk: usize,
    }

    impl ChunkedReader {
        fn new(data: Vec<u8>, chunk_sizes: Vec<usize>) -> Self {
            Self { data, pos: 0, chunk_sizes, next_chunk: 0 }
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let remaining = self.data.len() - self.pos;
            if remaining == 0 {
                return Ok(0);
            }
            let chunk = self.chunk_sizes.get(self.next_chunk).copied().unwrap_or(remaining);
            self.next_chunk += 1;
            let n = chunk.min(remaining).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn msg_parameter_status(name: &str, value: &str) -> Vec<u8> {
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);

        let mut frame = vec![b'S'];
        frame.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn read_message_into_reassembles_split_chunks() {
        let frame = msg_parameter_status("client_encoding", "UTF8");
        let mut reader = ChunkedReader::new(frame, vec![1, 3]);
        let mut buffers = BufferSet::new();

        read_message_into(&mut reader, &mut buffers).unwrap();

        assert_eq!(buffers.type_byte, b'S');

        let mut engine = ProtocolEngine::new(Opts { hostname: "localhost".to_string(), ..Default::default() });
        let action = engine
            .step(
                &mut buffers,
                Input::Message { type_byte: buffers.type_byte, payload: &buffers.read_buffer },
            )
            .unwrap();
        assert!(matches!(action, Action::HandleAsyncMessageAndReadMessage(_)));
        assert_eq!(engine.parameters().get("client_encoding"), Some(&"UTF8".to_string()));
    }
}

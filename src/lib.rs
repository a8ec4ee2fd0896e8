//! A single-connection PostgreSQL client driver built around one sans-I/O protocol engine:
//! every request, from catalog bootstrap to an ordinary query to a transaction boundary, runs
//! through the same extended-query state machine.
//!
//! ```no_run
//! use pg_engine::{Conn, Opts, Value};
//!
//! # fn main() -> pg_engine::Result<()> {
//! let mut conn = Conn::connect(Opts {
//!     hostname: "localhost".to_string(),
//!     username: "postgres".to_string(),
//!     ..Default::default()
//! })?;
//!
//! let result = conn.query("SELECT $1::int4 + 1", vec![Value::I32(41)])?;
//! assert_eq!(result.rows.unwrap()[0][0], Value::I32(42));
//! # Ok(())
//! # }
//! ```

// private
mod action;
mod buffer_pool;
mod buffer_set;
mod conn;
mod engine;
mod error;
mod opts;
mod registry;
mod transaction;
mod value;

// pub
pub mod protocol;

pub use action::AsyncMessage;
pub use conn::Conn;
pub use engine::{QueryOutcome, QueryResult};
pub use error::{Error, Result, ServerError};
pub use opts::{DecodeFormatter, Decoder, Encoder, Hooks, Opts};
pub use transaction::Operation as TransactionOperation;
pub use value::Value;

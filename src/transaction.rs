//! Nested-transaction tracker: a pure function over an integer nesting counter.
//!
//! The counter never drives I/O itself; the request actor calls [`apply`], and if it returns
//! SQL, runs it through the ordinary query path exactly like any caller-supplied query.

/// One of the three transaction-boundary operations a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Begin,
    Commit,
    Rollback,
}

/// Apply `operation` to `counter`, returning the SQL to send (if any) and the new counter.
///
/// Commits at depth > 1 are deferred (no SQL, just a decrement) so that only the outermost
/// `COMMIT` actually flushes. Rollbacks always take effect immediately.
pub fn apply(counter: u32, operation: Operation) -> (Option<String>, u32) {
    match operation {
        Operation::Begin => {
            if counter == 0 {
                (Some("BEGIN".to_string()), 1)
            } else {
                (Some(format!("SAVEPOINT postgrex_{counter}")), counter + 1)
            }
        }
        Operation::Commit => match counter {
            0 => (None, 0),
            1 => (Some("COMMIT".to_string()), 0),
            n => (None, n - 1),
        },
        Operation::Rollback => match counter {
            0 => (None, 0),
            1 => (Some("ROLLBACK".to_string()), 0),
            n => (
                Some(format!("ROLLBACK TO SAVEPOINT postgrex_{}", n - 1)),
                n - 1,
            ),
        },
    }
}

//! Seam to the concrete PostgreSQL wire codec.
//!
//! The pool core drives a libpq-style non-blocking protocol but does not
//! implement it; callers supply a [`WireFactory`] producing [`WireConnection`]
//! objects. The shipped [`crate::testkit`] contains a scripted implementation
//! for tests.

use std::any::Any;
use std::collections::BTreeMap;

use crate::error::Error;
use crate::query::WireParam;

/// Socket descriptor as reported by the wire library.
pub type SocketFd = i32;

/// Progress of a non-blocking connect or reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Connection is established and ready.
    Ok,
    /// Connection attempt failed.
    Failed,
    /// Waiting for the socket to become readable.
    Reading,
    /// Waiting for the socket to become writable.
    Writing,
}

/// Status of the first result of a command, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    CommandOk,
    TuplesOk,
    CopyIn,
    CopyOut,
    EmptyQuery,
    FatalError,
    BadResponse,
    /// Anything else the codec may report; treated as a failure.
    Other,
}

/// Server-side transaction status attached to the last ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No transaction open.
    Idle,
    /// A command is in flight.
    Active,
    /// Inside an open transaction block.
    InTransaction,
    /// Inside a failed transaction block.
    InError,
    /// Connection state unknown (e.g. never connected).
    Unknown,
}

impl TransactionStatus {
    /// An implicit transaction holds the connection whether the block is
    /// healthy or failed.
    #[must_use]
    pub fn in_transaction(self) -> bool {
        matches!(
            self,
            TransactionStatus::InTransaction | TransactionStatus::InError
        )
    }
}

/// Connection options as a key/value mapping (`host`, `port`, `dbname`, ...).
///
/// Keys iterate in deterministic (sorted) order, which makes the
/// [fingerprint](Self::fingerprint) usable as a persistent-pool registry key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    options: BTreeMap<String, String>,
}

impl ConnectionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Deterministic serialisation, `k1=v1;k2=v2;...` in key order.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.options {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectionOptions {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        ConnectionOptions {
            options: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// One result of a completed command. Row decoding is the caller's concern;
/// the pipeline only classifies the status.
pub trait WireResult: Send + std::fmt::Debug {
    fn status(&self) -> ResultStatus;

    /// Error message attached to this result, empty when none.
    fn error_message(&self) -> String;

    /// Downcast hook for callers that know the concrete codec.
    fn as_any(&self) -> &dyn Any;
}

/// One non-blocking wire connection to a PostgreSQL backend.
///
/// `send_*` enqueue protocol traffic; [`flush`](Self::flush) and
/// [`consume_input`](Self::consume_input) move bytes under readiness events;
/// [`get_result`](Self::get_result) yields the first result of the current
/// command. Implementations discard any further results, since multiple
/// result sets are unsupported.
pub trait WireConnection: Send {
    fn poll_connect(&mut self) -> PollingStatus;

    /// Begin an asynchronous reset of an existing connection.
    fn reset_start(&mut self) -> Result<(), Error>;

    fn poll_reset(&mut self) -> PollingStatus;

    fn send_raw(&mut self, sql: &str) -> Result<(), Error>;

    fn send_parameterized(
        &mut self,
        sql: &str,
        params: &[WireParam],
        binary: bool,
    ) -> Result<(), Error>;

    fn send_prepare(&mut self, statement: &str, sql: &str, num_params: usize)
    -> Result<(), Error>;

    fn send_prepared(
        &mut self,
        statement: &str,
        params: &[WireParam],
        binary: bool,
    ) -> Result<(), Error>;

    /// Consume pending input. Returns `true` once the current command has
    /// fully arrived and [`get_result`](Self::get_result) will not block.
    fn consume_input(&mut self) -> bool;

    /// Flush the send buffer. Returns `true` once the buffer is empty.
    fn flush(&mut self) -> bool;

    fn get_result(&mut self) -> Option<Box<dyn WireResult>>;

    /// Request cancellation of the command in flight. Best effort; the
    /// command may still complete successfully.
    fn cancel(&mut self);

    fn socket(&self) -> SocketFd;

    fn error_message(&self) -> String;

    fn transaction_status(&self) -> TransactionStatus;

    // Blocking counterparts used by the synchronous query path.

    fn exec_raw(&mut self, sql: &str) -> Result<Box<dyn WireResult>, Error>;

    fn exec_parameterized(
        &mut self,
        sql: &str,
        params: &[WireParam],
        binary: bool,
    ) -> Result<Box<dyn WireResult>, Error>;

    fn exec_prepare(
        &mut self,
        statement: &str,
        sql: &str,
        num_params: usize,
    ) -> Result<Box<dyn WireResult>, Error>;

    fn exec_prepared(
        &mut self,
        statement: &str,
        params: &[WireParam],
        binary: bool,
    ) -> Result<Box<dyn WireResult>, Error>;
}

/// Produces wire connections for a pool.
pub trait WireFactory: Send + Sync {
    /// Start a non-blocking connect; the returned connection is in the
    /// polling phase and must be driven with
    /// [`WireConnection::poll_connect`].
    fn connect_start(&self, options: &ConnectionOptions) -> Result<Box<dyn WireConnection>, Error>;

    /// Establish a connection synchronously, for the blocking query path.
    fn connect_blocking(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn WireConnection>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a: ConnectionOptions = [("host", "db1"), ("dbname", "app"), ("port", "5432")]
            .into_iter()
            .collect();
        let b: ConnectionOptions = [("port", "5432"), ("host", "db1"), ("dbname", "app")]
            .into_iter()
            .collect();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), "dbname=app;host=db1;port=5432");
    }

    #[test]
    fn in_transaction_covers_error_state() {
        assert!(TransactionStatus::InTransaction.in_transaction());
        assert!(TransactionStatus::InError.in_transaction());
        assert!(!TransactionStatus::Idle.in_transaction());
        assert!(!TransactionStatus::Active.in_transaction());
    }
}

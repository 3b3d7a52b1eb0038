// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
//
// Only the two fatal categories of the engine's error taxonomy (invariant
// violations, transport failures) are represented here. Stale and pending
// conflicts are recoverable and are surfaced as plain values (PendOutcome,
// CommitOutcome) by blockmesh-repo, never as an Error.

use std::borrow::Cow;
use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Coarse classification of a fatal error, so callers above blockmesh-repo
/// (chiefly the NetworkTransactor) can tell "this block's state is broken"
/// from "a peer didn't answer in time" without downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// An illegal Transform: delete-without-insert, insert-over-existing,
    /// out-of-range splice, etc. Not retryable.
    Invariant,
    /// A peer was unreachable or an RPC timed out. Retryable via an
    /// alternate coordinator.
    Transport,
    /// Anything not classified above.
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    inner: DynBacktraceError,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        Self::with_kind(Kind::Other, err)
    }

    pub fn with_kind<E: std::error::Error + Send + Sync + 'static>(kind: Kind, err: E) -> Error {
        error!(target: "blockmesh", kind = ?kind, "{:?}", err);
        let inner = DynBacktraceError::from(err);
        Error { kind, inner }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_transport(&self) -> bool {
        self.kind == Kind::Transport
    }

    pub fn is_invariant(&self) -> bool {
        self.kind == Kind::Invariant
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(SimpleErr(msg.into()))
}

pub fn invariant_err(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::with_kind(Kind::Invariant, SimpleErr(msg.into()))
}

pub fn transport_err(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::with_kind(Kind::Transport, SimpleErr(msg.into()))
}

#[test]
fn test_error() {
    let e = err("test error");
    assert_eq!(e.kind(), Kind::Other);
}

#[test]
fn test_invariant_and_transport_kinds() {
    assert!(invariant_err("bad splice").is_invariant());
    assert!(transport_err("peer unreachable").is_transport());
}

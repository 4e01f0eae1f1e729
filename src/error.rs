//! Error types for the circuit core
//!
//! This module provides the error taxonomy shared by every layer:
//! - Detailed error variants for different failure modes
//! - Classification (retryable vs not)
//! - Translation to the wire reason codes carried by DESTROY and END cells
//!
//! Errors never unwind across layers: cell decoding, handshake and stream
//! failures become values here, and the layer that owns the wire connection
//! translates them to DESTROY or END reasons.

use crate::protocol::cell::{DestroyReason, EndReason};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the circuit core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ===== Protocol Errors =====
    /// Malformed cell, bad relay header, verification mismatch, or a cell
    /// that is not legal in the current state.
    #[error("protocol violation: {0}")]
    Protocol(String),

    // ===== Resource Errors =====
    /// Ran out of circuit ids, stream ids, or a queue limit was hit.
    #[error("resource exhausted: {0}")]
    Resource(String),

    // ===== Connection Errors =====
    /// TCP/TLS to a peer was refused, reset, or never came up.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// A handshake or stream connect exceeded its deadline.
    #[error("timed out: {0}")]
    TimedOut(String),

    // ===== Policy Errors =====
    /// An exit or reachability policy forbids the requested action.
    #[error("rejected by policy: {0}")]
    PolicyRejected(String),

    // ===== Remote Close =====
    /// The peer tore the construct down first (DESTROY, or END with
    /// DONE/DESTROY).
    #[error("closed by remote: {0}")]
    RemoteClosed(String),

    // ===== Internal Errors =====
    /// An invariant was violated. Logged once with context; the affected
    /// circuit or stream is torn down and the process continues.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the operation that produced this error is worth retrying
    /// with a different relay or circuit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed(_)
                | Error::TimedOut(_)
                | Error::RemoteClosed(_)
                | Error::Resource(_)
        )
    }

    /// The DESTROY reason a circuit closed because of this error carries.
    pub fn destroy_reason(&self) -> DestroyReason {
        match self {
            Error::Protocol(_) => DestroyReason::Protocol,
            Error::Resource(_) => DestroyReason::ResourceLimit,
            Error::ConnectFailed(_) => DestroyReason::ConnectFailed,
            Error::TimedOut(_) => DestroyReason::Timeout,
            Error::PolicyRejected(_) => DestroyReason::Requested,
            Error::RemoteClosed(_) => DestroyReason::Destroyed,
            Error::Internal(_) => DestroyReason::Internal,
        }
    }

    /// The END reason a stream closed because of this error carries.
    pub fn end_reason(&self) -> EndReason {
        match self {
            Error::Protocol(_) => EndReason::TorProtocol,
            Error::Resource(_) => EndReason::ResourceLimit,
            Error::ConnectFailed(_) => EndReason::ConnectFailed,
            Error::TimedOut(_) => EndReason::Timeout,
            Error::PolicyRejected(_) => EndReason::ExitPolicy,
            Error::RemoteClosed(_) => EndReason::Destroy,
            Error::Internal(_) => EndReason::Internal,
        }
    }
}

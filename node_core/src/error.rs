//! Packed error taxonomy shared by every public entry point.
//!
//! A single [`NodeError`] can carry up to four [`ErrorKind`]s, most specific first, so that
//! a socket failure which in turn breaks a registration can be reported without losing either
//! layer of context. `Display` renders one line per kind.

use std::fmt;
use std::io;

/// Closed set of error kinds the core ever produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Ok,
    TransportIo,
    TransportTimeout,
    ProtocolMalformed,
    ProtocolMd5Mismatch,
    RpcServerRefused,
    RpcMethodFailed,
    MasterUnreachable,
    RegistrationConflict,
    SlotExhausted,
    BadArgument,
    InternalInvariant,
}

impl ErrorKind {
    fn message(self) -> &'static str {
        match self {
            ErrorKind::Ok => "ok",
            ErrorKind::TransportIo => "transport I/O error",
            ErrorKind::TransportTimeout => "transport timed out",
            ErrorKind::ProtocolMalformed => "malformed protocol data",
            ErrorKind::ProtocolMd5Mismatch => "message type MD5 mismatch",
            ErrorKind::RpcServerRefused => "RPC server refused the connection",
            ErrorKind::RpcMethodFailed => "RPC method call failed",
            ErrorKind::MasterUnreachable => "master is unreachable",
            ErrorKind::RegistrationConflict => "registration is in a conflicting state",
            ErrorKind::SlotExhausted => "no free slot available",
            ErrorKind::BadArgument => "bad argument",
            ErrorKind::InternalInvariant => "internal invariant violated",
        }
    }
}

const MAX_LAYERS: usize = 4;

/// A packed, layered error. Layer 0 is the most specific (usually the one a caller should
/// match on); later layers are broader context accumulated as the error propagated upward.
#[derive(Debug, Clone)]
pub struct NodeError {
    layers: [ErrorKind; MAX_LAYERS],
    count: usize,
    detail: Option<String>,
}

impl NodeError {
    pub fn new(kind: ErrorKind) -> NodeError {
        let mut layers = [ErrorKind::Ok; MAX_LAYERS];
        layers[0] = kind;
        NodeError {
            layers,
            count: 1,
            detail: None,
        }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> NodeError {
        let mut err = NodeError::new(kind);
        err.detail = Some(detail.into());
        err
    }

    /// Add a broader layer of context on top of the existing ones. Once the layer budget is
    /// exhausted, further context is silently dropped rather than panicking - the primary
    /// (layer 0) kind is what matters for control flow.
    pub fn layer(mut self, kind: ErrorKind) -> NodeError {
        if self.count < MAX_LAYERS {
            self.layers[self.count] = kind;
            self.count += 1;
        }
        self
    }

    /// The most specific kind, used by callers that need to `match` on a single value.
    pub fn primary(&self) -> ErrorKind {
        self.layers[0]
    }

    pub fn kinds(&self) -> &[ErrorKind] {
        &self.layers[..self.count]
    }

    pub fn is_ok(&self) -> bool {
        self.count == 1 && self.layers[0] == ErrorKind::Ok
    }

    pub fn ok() -> NodeError {
        NodeError::new(ErrorKind::Ok)
    }

    /// Render as a human-readable, multi-line message: one line per layer, most specific first.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, kind) in self.kinds().iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("  caused by: {}", kind.message()));
        }
        if let Some(detail) = &self.detail {
            out.push_str(&format!("\n  detail: {}", detail));
        }
        out
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl std::error::Error for NodeError {}

impl From<io::Error> for NodeError {
    fn from(io_error: io::Error) -> Self {
        let kind = match io_error.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::TransportTimeout,
            io::ErrorKind::ConnectionRefused => ErrorKind::MasterUnreachable,
            _ => ErrorKind::TransportIo,
        };
        NodeError::with_detail(kind, io_error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

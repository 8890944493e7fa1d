use thiserror::Error;

use crate::protocol::{Direction, SessionId};

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("no route configured for session {0}")]
    RouteNotFound(SessionId),

    #[error("target {addr} unreachable for session {id}: {source}")]
    TargetUnreachable {
        id: SessionId,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error("tunnel endpoint rejected {dir} leg with status {status}")]
    LegRejected { dir: Direction, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid tunnel URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl TunnelError {
    /// Errors after which retrying the same session cannot succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            TunnelError::RouteNotFound(_)
            | TunnelError::TargetUnreachable { .. }
            | TunnelError::SessionClosed(_) => true,
            TunnelError::LegRejected { status, .. } => matches!(status, 400 | 404 | 409 | 410 | 502),
            TunnelError::InvalidUrl(_) => true,
            TunnelError::Http(_) | TunnelError::Io(_) => false,
        }
    }

    /// The tunnel endpoint could not be reached at all.
    pub fn is_connect(&self) -> bool {
        matches!(self, TunnelError::Http(e) if e.is_connect())
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

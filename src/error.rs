//! Error taxonomy for the VLESS/Vision core.
//!
//! The kinds mirror the failure classes a session driver must branch on
//! (fall back to HTTP, reject with a warning, retry, or just tear down).
//! Internal helpers (buffer pools, connection pools) keep using
//! `anyhow::Result` the way the teacher crate does; this enum is the
//! typed surface the driver and the public API expose.

use thiserror::Error;

/// Whether a `ProtocolFraming` failure may still be handed to a
/// fallback HTTP forwarder, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Possible,
    NotPossible,
}

#[derive(Error, Debug)]
pub enum VlessError {
    #[error("protocol framing error: {message}")]
    ProtocolFraming {
        message: String,
        fallback: Fallback,
    },

    #[error("auth rejected: {0}")]
    AuthRejected(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("fatal/programming error: {0}")]
    Fatal(String),
}

impl VlessError {
    pub fn invalid_version(fallback: Fallback) -> Self {
        Self::ProtocolFraming {
            message: "invalid VLESS version".into(),
            fallback,
        }
    }

    pub fn invalid_user(fallback: Fallback) -> Self {
        Self::ProtocolFraming {
            message: "unknown user".into(),
            fallback,
        }
    }

    pub fn invalid_address() -> Self {
        Self::ProtocolFraming {
            message: "invalid address".into(),
            fallback: Fallback::NotPossible,
        }
    }

    pub fn malformed_addons(reason: impl Into<String>) -> Self {
        Self::ProtocolFraming {
            message: format!("malformed addons: {}", reason.into()),
            fallback: Fallback::NotPossible,
        }
    }

    /// True if the driver may still route this connection to a
    /// configured fallback instead of terminating it.
    pub fn fallback_possible(&self) -> bool {
        matches!(
            self,
            Self::ProtocolFraming {
                fallback: Fallback::Possible,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, VlessError>;

//! Error types for proxyhop

use hyper::StatusCode;
use std::io;

/// Main error type for outbound calls and their configuration
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Proxy refused tunnel to {target}: {status}")]
    TunnelRejected { target: String, status: StatusCode },

    #[error("Request handle was already resolved")]
    AlreadyResolved,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Error::Proxy(msg.into())
    }

    pub fn invalid_url(msg: impl Into<String>) -> Self {
        Error::InvalidUrl(msg.into())
    }

    pub fn tunnel_rejected(target: impl Into<String>, status: StatusCode) -> Self {
        Error::TunnelRejected {
            target: target.into(),
            status,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

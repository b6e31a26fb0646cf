//! Trait seams over collaborators this crate does not implement: the
//! outer transport (TCP/TLS/REALITY/gRPC/...), the outbound dispatcher,
//! and the HTTP fallback handler. Concrete transports are out of scope
//! (spec Non-goal); these traits are the contract the session driver
//! and [`crate::vision`] need from whatever implements them.
//!
//! Grounded on the teacher's `tls::accept_tls` / `TlsStream<TcpStream>`
//! usage in `server.rs`, generalized to a trait since the concrete type
//! is no longer pinned to `tokio_rustls`.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::VlessError;
use crate::protocol::Address;

/// TLS protocol version of the outer transport, as observed by the
/// driver deciding whether Vision's direct-copy path is eligible
/// (spec §6: "must be TLS 1.3 when Vision is used").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
    Unknown,
}

/// The outer transport connection, abstracted over whatever concrete
/// stack terminates TLS/REALITY/gRPC/etc. The Vision flow consumes
/// this instead of a concrete `TlsStream<TcpStream>`.
pub trait SecureStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Negotiated TLS version of the outer handshake, if known.
    fn tls_version(&self) -> Option<TlsVersion>;

    /// Bytes already decrypted but not yet delivered to the reader
    /// (read-ahead the outer TLS implementation buffered internally).
    /// Must be drained before any direct-copy splice begins, or those
    /// bytes are lost.
    fn pending_plaintext(&mut self) -> bytes::Bytes {
        bytes::Bytes::new()
    }

    /// Raw (still-encrypted) bytes the outer transport has already
    /// read off the socket but not yet processed.
    fn pending_ciphertext(&mut self) -> bytes::Bytes {
        bytes::Bytes::new()
    }

    /// Raw underlying socket for direct-copy splicing, where the
    /// platform supports it (Linux/Android via `splice(2)`). `None`
    /// elsewhere, in which case direct-copy falls back to a normal
    /// encrypted copy through this same stream.
    fn raw_socket(&self) -> Option<&tokio::net::TcpStream> {
        None
    }
}

/// An established outbound connection, split into independent
/// read/write halves so a pump can move each direction concurrently.
pub struct Link {
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
    pub writer: Box<dyn AsyncWrite + Unpin + Send>,
}

/// Resolves a VLESS request's destination to an outbound connection.
/// Concrete routing (direct dial, upstream proxy chaining, domain
/// rules) is out of scope; this is the seam the session driver calls.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, destination: &(Address, u16)) -> Result<Link, VlessError>;
}

/// Hands a connection whose first bytes failed VLESS framing off to a
/// configured fallback (e.g. a local HTTP server), per spec §7's
/// `Fallback::Possible` cases. Out of scope to implement a real HTTP
/// server here; this is the hand-off point.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(
        &self,
        prefix: bytes::Bytes,
        stream: Box<dyn SecureStream>,
        client_addr: SocketAddr,
    ) -> Result<(), VlessError>;
}

//! Inbound/outbound session drivers: accept → decode → dispatch → pump
//! for inbound, and the symmetric dial → encode → pump for outbound
//! (spec §2 control flow, §4.4).
//!
//! Grounded on the teacher's `server.rs::handle_connection`/
//! `handle_tls_connection`, rewritten against the `SecureStream`/
//! `Dispatcher`/`FallbackHandler` traits instead of concrete
//! `TcpStream`/`TlsStream<TcpStream>` types, since the outer transport
//! and routing layer are out of scope here.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{info, warn};

use crate::error::{Fallback, VlessError};
use crate::protocol::{Command, RequestHeader, ResponseHeader};
use crate::pump::{self, PumpTimeouts, TrafficCounters, VisionSide};
use crate::transport::{Dispatcher, FallbackHandler, SecureStream, TlsVersion};
use crate::user::{Flow, UserValidator};
use crate::vision::TrafficState;

/// RAII session counter; a no-op metrics hook by default since a
/// metrics backend is out of scope here. Grounded on the teacher's
/// `ConnectionGuard` in `server.rs`, which likewise only touched an
/// in-process counter rather than a real metrics sink.
pub struct ConnectionGuard {
    active: Arc<AtomicU64>,
}

impl ConnectionGuard {
    pub fn new(active: Arc<AtomicU64>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self { active }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Chains a small already-read prefix ahead of an inner stream, so
/// bytes the header decoder consumed past the header aren't lost
/// before the body pump starts reading.
struct PrefixedReader<R> {
    prefix: Bytes,
    inner: R,
}

impl<R> PrefixedReader<R> {
    fn new(prefix: Bytes, inner: R) -> Self {
        Self { prefix, inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = std::cmp::min(self.prefix.len(), buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for PrefixedReader<R> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Bytes pre-read before attempting header decode, enough for
/// "first-byte-ahead" mode (version + raw UUID, spec §4.1) and, on a
/// fallback-eligible error, the hand-off prefix for the fallback
/// handler.
const PREFIX_LEN: usize = 18;

/// Everything an inbound driver needs that isn't part of a single
/// connection: the user table, the outbound dispatcher, an optional
/// HTTP-style fallback, and the session's timeout policy.
pub struct InboundConfig {
    pub validator: Arc<UserValidator>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub fallback: Option<Arc<dyn FallbackHandler>>,
    pub timeouts: PumpTimeouts,
    pub active_sessions: Arc<AtomicU64>,
}

fn flow_wire_name(flow: Flow) -> &'static str {
    match flow {
        Flow::Vision => "xtls-rprx-vision",
        Flow::None => "",
    }
}

/// Drives one inbound VLESS session end to end (spec §2 steps 2-5):
/// decode the header, validate the user and flow, dispatch to the
/// destination, and pump both directions.
pub async fn handle_inbound<S>(
    mut stream: S,
    client_addr: SocketAddr,
    config: &InboundConfig,
) -> Result<(), VlessError>
where
    S: SecureStream + 'static,
{
    let _guard = ConnectionGuard::new(Arc::clone(&config.active_sessions));

    let mut prefix_buf = vec![0u8; PREFIX_LEN];
    stream
        .read_exact(&mut prefix_buf)
        .await
        .map_err(VlessError::from)?;
    let prefix = Bytes::from(prefix_buf);

    let (header, leftover) = match RequestHeader::decode(&mut stream, prefix.clone()).await {
        Ok(ok) => ok,
        Err(e) if e.fallback_possible() => {
            return run_fallback(config, prefix, Box::new(stream), client_addr, e).await;
        }
        Err(e) => {
            warn!(%client_addr, error = %e, "rejecting connection: header decode failed");
            return Err(e);
        }
    };

    let user = match config.validator.get(&header.uuid).await {
        Some(user) => user,
        None => {
            warn!(%client_addr, uuid = %header.uuid, "rejecting connection: unknown user");
            let err = VlessError::invalid_user(Fallback::Possible);
            return run_fallback(config, prefix, Box::new(stream), client_addr, err).await;
        }
    };

    let requested_flow = Flow::parse(header.addons.flow.as_deref())
        .ok_or_else(|| VlessError::AuthRejected("unsupported flow string".into()))?;
    if requested_flow != user.flow {
        return Err(VlessError::AuthRejected(format!(
            "account flow does not match requested flow for user {}",
            header.uuid
        )));
    }
    if requested_flow == Flow::Vision {
        if !matches!(header.command, Command::Tcp) {
            return Err(VlessError::AuthRejected(
                "vision flow does not support UDP/Mux".into(),
            ));
        }
        if stream.tls_version() != Some(TlsVersion::Tls13) {
            return Err(VlessError::AuthRejected(
                "vision flow requires a TLS 1.3 outer transport".into(),
            ));
        }
    }

    info!(
        %client_addr,
        uuid = %header.uuid,
        destination = %header.address,
        port = header.port,
        flow = ?requested_flow,
        "accepted vless session"
    );

    let link = config
        .dispatcher
        .dispatch(&(header.address.clone(), header.port))
        .await?;

    let traffic_state = match requested_flow {
        Flow::Vision => Some((
            Arc::new(TrafficState::new(*header.uuid.as_bytes())),
            VisionSide::Client,
        )),
        Flow::None => None,
    };

    let response = ResponseHeader::encode(header.version, flow_wire_name(requested_flow));
    let prefixed = PrefixedReader::new(leftover, stream);
    let (client_reader, mut client_writer) = tokio::io::split(prefixed);
    client_writer
        .write_all(&response)
        .await
        .map_err(VlessError::from)?;

    let counters = Arc::new(TrafficCounters::default());
    pump::run(
        client_reader,
        client_writer,
        link.reader,
        link.writer,
        traffic_state,
        config.timeouts,
        Some(counters),
    )
    .await
}

/// Hands the connection to the configured fallback, or, when none is
/// configured, rejects it with the original decode/lookup error (spec
/// §7: "Otherwise the session terminates with an access-rejected log
/// entry").
async fn run_fallback(
    config: &InboundConfig,
    prefix: Bytes,
    stream: Box<dyn SecureStream>,
    client_addr: SocketAddr,
    original_err: VlessError,
) -> Result<(), VlessError> {
    match &config.fallback {
        Some(fallback) => fallback.handle(prefix, stream, client_addr).await,
        None => {
            warn!(%client_addr, "no fallback configured, rejecting connection");
            Err(original_err)
        }
    }
}

/// Everything an outbound driver needs to start a session toward a
/// remote VLESS server: the account to authenticate with and the
/// session's timeout policy. Symmetric to [`InboundConfig`] (spec §2
/// "Outbound is symmetric").
pub struct OutboundConfig {
    pub timeouts: PumpTimeouts,
}

/// Drives one outbound VLESS session: encode the request header, write
/// it, then pump both directions between the local client link and the
/// now-authenticated remote stream.
pub async fn handle_outbound<S>(
    mut stream: S,
    uuid: uuid::Uuid,
    flow: Flow,
    command: Command,
    port: u16,
    address: crate::protocol::Address,
    local_link: crate::transport::Link,
    config: &OutboundConfig,
) -> Result<(), VlessError>
where
    S: SecureStream + 'static,
{
    let request = RequestHeader::encode(&uuid, flow_wire_name(flow), command, port, &address);
    stream.write_all(&request).await.map_err(VlessError::from)?;

    let response = ResponseHeader::decode(&mut stream, request[0]).await?;
    if flow == Flow::Vision && response.addons.flow.as_deref() != Some("xtls-rprx-vision") {
        return Err(VlessError::AuthRejected(
            "remote did not confirm vision flow".into(),
        ));
    }

    let traffic_state = match flow {
        Flow::Vision => Some((Arc::new(TrafficState::new(*uuid.as_bytes())), VisionSide::Dest)),
        Flow::None => None,
    };

    let (remote_reader, remote_writer) = tokio::io::split(stream);
    pump::run(
        local_link.reader,
        local_link.writer,
        remote_reader,
        remote_writer,
        traffic_state,
        config.timeouts,
        None,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Address;
    use crate::user::MemoryUser;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    struct TestStream {
        inner: tokio::io::DuplexStream,
        tls_version: Option<TlsVersion>,
    }

    impl AsyncRead for TestStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TestStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }
        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }
        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl SecureStream for TestStream {
        fn tls_version(&self) -> Option<TlsVersion> {
            self.tls_version
        }
    }

    struct EchoDispatcher;

    #[async_trait]
    impl Dispatcher for EchoDispatcher {
        async fn dispatch(
            &self,
            _destination: &(Address, u16),
        ) -> Result<crate::transport::Link, VlessError> {
            let (a, b) = duplex(4096);
            let (ar, aw) = tokio::io::split(a);
            tokio::spawn(async move {
                let (mut br, mut bw) = tokio::io::split(b);
                let _ = tokio::io::copy(&mut br, &mut bw).await;
            });
            Ok(crate::transport::Link {
                reader: Box::new(ar),
                writer: Box::new(aw),
            })
        }
    }

    #[tokio::test]
    async fn plain_session_echoes_payload_to_destination() {
        let validator = UserValidator::new();
        let uuid = uuid::Uuid::new_v4();
        validator
            .add(MemoryUser::new(uuid, "user@example.com", 0, Flow::None))
            .await
            .unwrap();

        let config = InboundConfig {
            validator,
            dispatcher: Arc::new(EchoDispatcher),
            fallback: None,
            timeouts: PumpTimeouts {
                connection_idle: std::time::Duration::from_millis(300),
                ..Default::default()
            },
            active_sessions: Arc::new(AtomicU64::new(0)),
        };

        let (client_side, server_side) = duplex(8192);
        let server = tokio::spawn(async move {
            let stream = TestStream {
                inner: server_side,
                tls_version: None,
            };
            handle_inbound(stream, "127.0.0.1:1".parse().unwrap(), &config).await
        });

        let request = RequestHeader::encode(
            &uuid,
            "",
            Command::Tcp,
            9000,
            &Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1)),
        );
        let (mut client_read, mut client_write) = tokio::io::split(client_side);
        client_write.write_all(&request).await.unwrap();
        client_write.write_all(b"hello").await.unwrap();

        let mut resp = [0u8; 2];
        client_read.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0u8, 0u8]);

        let mut echo = [0u8; 5];
        client_read.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");

        drop(client_write);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), server).await;
    }

    #[tokio::test]
    async fn unknown_user_without_fallback_is_rejected() {
        let validator = UserValidator::new();
        let config = InboundConfig {
            validator,
            dispatcher: Arc::new(EchoDispatcher),
            fallback: None,
            timeouts: PumpTimeouts::default(),
            active_sessions: Arc::new(AtomicU64::new(0)),
        };

        let (client_side, server_side) = duplex(8192);
        let server = tokio::spawn(async move {
            let stream = TestStream {
                inner: server_side,
                tls_version: None,
            };
            handle_inbound(stream, "127.0.0.1:1".parse().unwrap(), &config).await
        });

        let request = RequestHeader::encode(
            &uuid::Uuid::new_v4(),
            "",
            Command::Tcp,
            9000,
            &Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1)),
        );
        let (_client_read, mut client_write) = tokio::io::split(client_side);
        client_write.write_all(&request).await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(VlessError::ProtocolFraming { .. })));
    }
}

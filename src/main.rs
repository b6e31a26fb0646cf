//! Demo binary: accepts plain TCP VLESS connections (no outer TLS —
//! terminating TLS/REALITY/gRPC is out of scope for this crate, see
//! `transport::SecureStream`) and proxies them to their requested
//! destination via a direct dial.

use std::env;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use mimalloc::MiMalloc;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use async_trait::async_trait;

use vless_vision_core::config::Config;
use vless_vision_core::error::VlessError;
use vless_vision_core::protocol::Address;
use vless_vision_core::session::{handle_inbound, InboundConfig};
use vless_vision_core::transport::{Dispatcher, Link, SecureStream, TlsVersion};
use vless_vision_core::utils::configure_tcp_socket;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Wraps a bare `TcpStream` as a [`SecureStream`] with no outer TLS,
/// since this demo never terminates TLS itself.
struct PlainStream(TcpStream);

impl AsyncRead for PlainStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for PlainStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl SecureStream for PlainStream {
    fn tls_version(&self) -> Option<TlsVersion> {
        None
    }
}

/// Bare direct-dial glue for this demo binary. Real routing/dispatch
/// policy is out of scope for the core crate; a running demo still
/// needs somewhere to send bytes.
struct DirectDialer;

#[async_trait]
impl Dispatcher for DirectDialer {
    async fn dispatch(&self, destination: &(Address, u16)) -> Result<Link, VlessError> {
        let (address, port) = destination;
        let host = address.to_string();
        let stream = TcpStream::connect((host.as_str(), *port))
            .await
            .map_err(VlessError::from)?;
        if let Err(e) = configure_tcp_socket(&stream, 0, 0, true) {
            warn!("failed to tune outbound socket to {}:{}: {}", host, port, e);
        }
        let (reader, writer) = tokio::io::split(stream);
        Ok(Link {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        let content = std::fs::read_to_string(&config_path)?;
        info!("loading config from {}", config_path);
        Config::from_json(&content)?
    } else {
        info!("config file {} not found, using a generated default", config_path);
        Config::default()
    };

    let validator = config.build_validator().await?;
    info!("loaded {} users", validator.count().await);

    let bind_addr = config.bind_addr()?;
    let listener = TcpListener::bind(bind_addr).await?;
    info!("listening on {}", bind_addr);

    let inbound_config = Arc::new(InboundConfig {
        validator,
        dispatcher: Arc::new(DirectDialer),
        fallback: None,
        timeouts: config.pump_timeouts(),
        active_sessions: Arc::new(AtomicU64::new(0)),
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, client_addr): (TcpStream, SocketAddr) = accepted?;
                if let Err(e) = configure_tcp_socket(&stream, 0, 0, true) {
                    warn!("failed to tune accepted socket from {}: {}", client_addr, e);
                }
                let config = Arc::clone(&inbound_config);
                tokio::spawn(async move {
                    let stream = PlainStream(stream);
                    if let Err(e) = handle_inbound(stream, client_addr, &config).await {
                        error!(%client_addr, error = %e, "session ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, stopping accept loop");
                return Ok(());
            }
        }
    }
}

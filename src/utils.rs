//! Small socket helpers shared by the inbound/outbound dial paths.

use anyhow::Result;
use socket2::SockRef;
use tracing::debug;

/// Tunes a freshly accepted/connected TCP socket for proxy traffic:
/// `TCP_NODELAY` and optional send/recv buffer sizes (`0` leaves the OS
/// default alone).
pub fn configure_tcp_socket(
    stream: &tokio::net::TcpStream,
    recv_buf: usize,
    send_buf: usize,
    nodelay: bool,
) -> Result<()> {
    if nodelay {
        stream.set_nodelay(true)?;
    }

    let socket = SockRef::from(stream);

    if recv_buf > 0 {
        if let Err(e) = socket.set_recv_buffer_size(recv_buf) {
            debug!("failed to set recv buffer size to {}: {}", recv_buf, e);
        } else {
            debug!("set recv buffer size to {}", recv_buf);
        }
    }

    if send_buf > 0 {
        if let Err(e) = socket.set_send_buffer_size(send_buf) {
            debug!("failed to set send buffer size to {}: {}", send_buf, e);
        } else {
            debug!("set send buffer size to {}", send_buf);
        }
    }

    Ok(())
}

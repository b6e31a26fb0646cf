//! Bidirectional pump: moves bytes between the inbound client stream
//! and the outbound destination link, applying Vision padding/unpadding
//! when the session negotiated the Vision flow.
//!
//! Grounded on the teacher's `server.rs::handle_bidirectional_transfer`
//! (split reader/writer, two `tokio::spawn`ed tasks, batched counters,
//! `tokio::join!`), extended with the idle/per-direction timers and
//! cancellation the teacher's transfer loop doesn't have.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffers::buf;
use crate::error::VlessError;
use crate::vision::{PadWriter, ReaderRole, TrafficState, UnpadReader, WriterRole};

/// Timeouts governing one session's pump (spec §5).
#[derive(Debug, Clone, Copy)]
pub struct PumpTimeouts {
    /// Torn down if neither direction sees activity for this long.
    pub connection_idle: Duration,
    /// Once the uplink direction finishes, how long to wait for the
    /// downlink to drain before cancelling it too.
    pub uplink_only: Duration,
    /// Symmetric grace period once downlink finishes first.
    pub downlink_only: Duration,
}

impl Default for PumpTimeouts {
    fn default() -> Self {
        Self {
            connection_idle: Duration::from_secs(300),
            uplink_only: Duration::from_secs(2),
            downlink_only: Duration::from_secs(2),
        }
    }
}

/// Byte counters updated only when a stat adapter wraps the pump
/// (spec §5: "counters only when stat-adapter wraps stream").
#[derive(Default)]
pub struct TrafficCounters {
    pub uplink_bytes: AtomicU64,
    pub downlink_bytes: AtomicU64,
}

const STATS_BATCH_SIZE: u64 = 1 << 20;

/// Vision wrapping for one pump direction. Only one side of any given
/// direction can be the Vision peer (spec §4.4: `post_request` unpads
/// the inbound reader and writes the outbound writer untouched;
/// `get_response` is the mirror, padding only). A direction is either
/// unpad-only (its reader is the Vision peer), pad-only (its writer
/// is), or plain when the session didn't negotiate Vision at all.
pub enum Framing {
    Plain,
    Unpad { state: Arc<TrafficState>, role: ReaderRole },
    Pad { state: Arc<TrafficState>, role: WriterRole },
}

/// Which physical stream is the Vision-encoded peer for a session:
/// the inbound client (spec's `handle_inbound`) or the outbound
/// destination (spec's `handle_outbound`, once it has negotiated
/// Vision with the remote). The other stream carries untransformed
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionSide {
    Client,
    Dest,
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    framing: Framing,
    counter: Option<Arc<TrafficCounters>>,
    is_uplink: bool,
    cancel: CancellationToken,
    activity: Arc<Mutex<Instant>>,
) -> Result<u64, VlessError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut read_buf = vec![0u8; buf::SIZE];
    let mut total = 0u64;
    let mut batch = 0u64;

    let mut unpad = match &framing {
        Framing::Unpad { state, role } => Some(UnpadReader::new(Arc::clone(state), *role)),
        _ => None,
    };
    let mut pad = match &framing {
        Framing::Pad { state, role } => Some(PadWriter::new(Arc::clone(state), *role)),
        _ => None,
    };

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(is_uplink, "pump direction cancelled");
                break;
            }
            result = reader.read(&mut read_buf) => result.map_err(VlessError::from)?,
        };
        if n == 0 {
            break;
        }
        *activity.lock().unwrap() = Instant::now();

        let decoded = match &mut unpad {
            Some(u) => u.feed(&read_buf[..n]),
            None => bytes::Bytes::copy_from_slice(&read_buf[..n]),
        };
        if decoded.is_empty() {
            // Header/padding-only bytes: nothing to forward yet.
            continue;
        }

        match &mut pad {
            Some(p) if p.is_padding() => {
                let encoded = p.encode(&decoded);
                for frame in &encoded.frames {
                    writer.write_all(frame).await.map_err(VlessError::from)?;
                }
                if let Some(tail) = encoded.direct_tail {
                    writer.write_all(&tail).await.map_err(VlessError::from)?;
                }
            }
            _ => {
                writer.write_all(&decoded).await.map_err(VlessError::from)?;
            }
        }

        total += decoded.len() as u64;
        batch += decoded.len() as u64;
        if let Some(counter) = &counter {
            if batch >= STATS_BATCH_SIZE {
                let field = if is_uplink {
                    &counter.uplink_bytes
                } else {
                    &counter.downlink_bytes
                };
                field.fetch_add(batch, Ordering::Relaxed);
                batch = 0;
            }
        }

        if let Some(u) = &unpad {
            if u.direct_copy_active() {
                debug!(is_uplink, "vision: reader switching to direct copy");
            }
        }
    }

    if let Some(counter) = &counter {
        if batch > 0 {
            let field = if is_uplink {
                &counter.uplink_bytes
            } else {
                &counter.downlink_bytes
            };
            field.fetch_add(batch, Ordering::Relaxed);
        }
    }

    let _ = writer.shutdown().await;
    Ok(total)
}

/// Watches shared `activity`, cancelling the session once it goes
/// longer than `idle` untouched. Re-checks rather than sleeping a fixed
/// deadline, since a read anywhere resets the clock (spec §5: "on
/// activity, each successful buffer read calls `timer.update()`").
async fn idle_watch(activity: Arc<Mutex<Instant>>, idle: Duration, cancel: CancellationToken) {
    loop {
        let elapsed = activity.lock().unwrap().elapsed();
        if elapsed >= idle {
            warn!("session idle timeout, cancelling both directions");
            cancel.cancel();
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(idle - elapsed) => {}
        }
    }
}

fn join_result(result: std::result::Result<Result<u64, VlessError>, JoinError>) -> Result<u64, VlessError> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Err(VlessError::Cancelled),
        Err(e) => Err(VlessError::Fatal(format!("pump task panicked: {e}"))),
    }
}

/// Drives one session's full-duplex transfer: `post_request` (client to
/// destination, "uplink") and `get_response` (destination to client,
/// "downlink") run concurrently. Spec §4.4/§5: an idle timer tears the
/// whole session down on inactivity; once one direction finishes, the
/// other gets at most its direction's grace period before being
/// cancelled too.
pub async fn run<CR, CW, DR, DW>(
    client_reader: CR,
    client_writer: CW,
    dest_reader: DR,
    dest_writer: DW,
    vision: Option<(Arc<TrafficState>, VisionSide)>,
    timeouts: PumpTimeouts,
    counters: Option<Arc<TrafficCounters>>,
) -> Result<(), VlessError>
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    DR: AsyncRead + Unpin + Send + 'static,
    DW: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();
    let activity = Arc::new(Mutex::new(Instant::now()));

    let (uplink_framing, downlink_framing) = match vision {
        None => (Framing::Plain, Framing::Plain),
        Some((state, VisionSide::Client)) => (
            Framing::Unpad {
                state: Arc::clone(&state),
                role: ReaderRole::InboundUplink,
            },
            Framing::Pad {
                state,
                role: WriterRole::InboundDownlink,
            },
        ),
        Some((state, VisionSide::Dest)) => (
            Framing::Pad {
                state: Arc::clone(&state),
                role: WriterRole::OutboundUplink,
            },
            Framing::Unpad {
                state,
                role: ReaderRole::OutboundDownlink,
            },
        ),
    };

    let uplink_cancel = cancel.clone();
    let uplink_counters = counters.clone();
    let uplink_activity = Arc::clone(&activity);
    let mut uplink = tokio::spawn(async move {
        copy_direction(
            client_reader,
            dest_writer,
            uplink_framing,
            uplink_counters,
            true,
            uplink_cancel,
            uplink_activity,
        )
        .await
    });

    let downlink_cancel = cancel.clone();
    let downlink_counters = counters;
    let downlink_activity = Arc::clone(&activity);
    let mut downlink = tokio::spawn(async move {
        copy_direction(
            dest_reader,
            client_writer,
            downlink_framing,
            downlink_counters,
            false,
            downlink_cancel,
            downlink_activity,
        )
        .await
    });

    let idle_cancel = cancel.clone();
    let idle_task = tokio::spawn(idle_watch(activity, timeouts.connection_idle, idle_cancel));

    enum Finished {
        UplinkFirst(Result<u64, VlessError>),
        DownlinkFirst(Result<u64, VlessError>),
    }

    let first = tokio::select! {
        r = &mut uplink => Finished::UplinkFirst(join_result(r)),
        r = &mut downlink => Finished::DownlinkFirst(join_result(r)),
    };

    let result = match first {
        Finished::UplinkFirst(up_result) => {
            let grace = timeouts.downlink_only;
            let down_result = tokio::select! {
                r = &mut downlink => join_result(r),
                _ = tokio::time::sleep(grace) => {
                    debug!("downlink grace period elapsed, cancelling");
                    cancel.cancel();
                    join_result(downlink.await)
                }
            };
            up_result.and(down_result)
        }
        Finished::DownlinkFirst(down_result) => {
            let grace = timeouts.uplink_only;
            let up_result = tokio::select! {
                r = &mut uplink => join_result(r),
                _ = tokio::time::sleep(grace) => {
                    debug!("uplink grace period elapsed, cancelling");
                    cancel.cancel();
                    join_result(uplink.await)
                }
            };
            down_result.and(up_result)
        }
    };

    cancel.cancel();
    idle_task.abort();

    result.map(|_| ())
}

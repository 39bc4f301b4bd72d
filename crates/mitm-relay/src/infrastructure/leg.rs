//! Framed I/O on one leg of a session.
//!
//! A leg is one side of the relay: the client-facing socket or the
//! server-facing socket.  Each leg has one reader (bytes → packets) and one
//! writer (packets → frames → bytes).
//!
//! # Binary streaming protocol
//!
//! TCP is a *stream* protocol: a single `read()` call may return less than one
//! complete frame, or more than one.  [`read_frames`] buffers incoming bytes
//! and uses [`split_frame`] to cut complete frames off the front of the
//! buffer one at a time.
//!
//! Both functions are generic over `AsyncRead`/`AsyncWrite`, so tests drive
//! them with in-memory duplex pipes instead of sockets.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, warn};

use mitm_core::protocol::codec::{decode_frame, encode_packet, split_frame, CodecError, CodecState};
use mitm_core::protocol::packets::GamePacket;

use crate::infrastructure::session::{SessionCounters, SessionError};

/// Size of each individual `read()` into the receive buffer.
const READ_CHUNK: usize = 16 * 1024;

/// Why a leg reader or writer stopped.
#[derive(Debug)]
pub enum LegEnd {
    /// The peer closed its side (`read()` returned 0).
    Eof,
    /// Nothing arrived within the idle timeout.
    IdleTimeout(Duration),
    /// The byte stream lost frame sync; it cannot be recovered.
    Framing(CodecError),
    /// The socket failed.
    Io(std::io::Error),
    /// The session asked this leg to stop.
    Stopped,
}

// ── Upstream connection ───────────────────────────────────────────────────────

/// Opens the server-facing leg.
///
/// # Errors
///
/// Returns [`SessionError::ConnectTimeout`] if the server does not answer in
/// time and [`SessionError::Connect`] if the connection is refused or fails.
pub async fn connect_upstream(addr: SocketAddr, limit: Duration) -> Result<TcpStream, SessionError> {
    let stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| SessionError::ConnectTimeout { addr, limit })?
        .map_err(|source| SessionError::Connect { addr, source })?;

    // Game traffic is many small packets; Nagle only adds latency.
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not disable Nagle on upstream {addr}: {e}");
    }
    Ok(stream)
}

// ── Streaming frame reader ────────────────────────────────────────────────────

/// Reads frames from `reader` until the leg ends, handing every decoded
/// packet (or per-packet decode error) to `on_packet`, in wire order.
///
/// Decode errors inside a well-framed body are passed on and reading
/// continues.  Framing errors end the leg because the next frame boundary is
/// unknown.  `on_packet` returning `Break` stops the reader with
/// [`LegEnd::Stopped`].
pub async fn read_frames<R, F>(mut reader: R, idle_timeout: Duration, mut on_packet: F) -> LegEnd
where
    R: AsyncRead + Unpin,
    F: FnMut(Result<GamePacket, CodecError>) -> ControlFlow<()>,
{
    // Streaming receive buffer — accumulates bytes across multiple read() calls.
    let mut recv_buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    // Temporary read buffer for each individual `read()` call.
    let mut read_tmp = vec![0u8; READ_CHUNK];

    loop {
        let n = match timeout(idle_timeout, reader.read(&mut read_tmp)).await {
            Err(_) => return LegEnd::IdleTimeout(idle_timeout),
            Ok(Ok(0)) => return LegEnd::Eof,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return LegEnd::Io(e),
        };
        recv_buf.extend_from_slice(&read_tmp[..n]);

        // A single read may have delivered several complete frames.
        loop {
            let (results, consumed) = match split_frame(&recv_buf) {
                Ok(None) => break,
                Err(e) => return LegEnd::Framing(e),
                Ok(Some((frame, consumed))) => match decode_frame(frame) {
                    Ok(results) => (results, consumed),
                    // Unusable body: report once and skip the whole frame.
                    Err(e) => (vec![Err(e)], consumed),
                },
            };
            recv_buf.drain(..consumed);

            for result in results {
                if on_packet(result).is_break() {
                    return LegEnd::Stopped;
                }
            }
        }
    }
}

// ── Batching frame writer ─────────────────────────────────────────────────────

/// Drains `outbox` onto `writer` until every sender is gone or the socket
/// fails.
///
/// Whatever is already queued when the writer wakes up (up to `max_batch`
/// packets) goes out as one frame, in queue order.  A packet that fails to
/// encode is dropped on its own; the rest of the batch is still sent.
pub async fn write_frames<W>(
    mut writer: W,
    mut outbox: UnboundedReceiver<GamePacket>,
    max_batch: usize,
    counters: &SessionCounters,
    label: &str,
) -> LegEnd
where
    W: AsyncWrite + Unpin,
{
    let mut codec = CodecState::default();
    let mut batch: Vec<GamePacket> = Vec::with_capacity(max_batch);

    loop {
        if outbox.recv_many(&mut batch, max_batch).await == 0 {
            return LegEnd::Stopped;
        }
        if let Err(e) = write_batch(&mut writer, &mut codec, &mut batch, counters, label).await {
            return LegEnd::Io(e);
        }
    }
}

async fn write_batch<W>(
    writer: &mut W,
    codec: &mut CodecState,
    batch: &mut Vec<GamePacket>,
    counters: &SessionCounters,
    label: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut pending: Vec<Vec<u8>> = Vec::with_capacity(batch.len());

    for packet in batch.drain(..) {
        match encode_packet(&packet) {
            Ok(bytes) => pending.push(bytes),
            Err(e) => {
                counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("{label}: dropping {} that failed to encode: {e}", packet.name());
                continue;
            }
        }

        // The frame announcing compression must itself go out plain, and
        // everything after it is framed with the new settings.
        if let GamePacket::NetworkSettings { .. } = packet {
            flush_frame(writer, codec, &mut pending, counters, label).await?;
            codec.observe_sent(&packet);
            debug!("{label}: compression threshold now {:?}", codec.compression_threshold);
        }
    }

    flush_frame(writer, codec, &mut pending, counters, label).await?;
    writer.flush().await
}

async fn flush_frame<W>(
    writer: &mut W,
    codec: &CodecState,
    pending: &mut Vec<Vec<u8>>,
    counters: &SessionCounters,
    label: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if pending.is_empty() {
        return Ok(());
    }

    match codec.encode_frame(pending) {
        Ok(frame) => writer.write_all(&frame).await?,
        Err(e) if pending.len() > 1 => {
            // Too big as one frame; fall back to one frame per packet.
            debug!("{label}: splitting batch of {} ({e})", pending.len());
            for packet in pending.iter() {
                match codec.encode_frame(std::slice::from_ref(packet)) {
                    Ok(frame) => writer.write_all(&frame).await?,
                    Err(e) => {
                        counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("{label}: dropping oversized packet: {e}");
                    }
                }
            }
        }
        Err(e) => {
            counters.encode_errors.fetch_add(1, Ordering::Relaxed);
            warn!("{label}: dropping oversized packet: {e}");
        }
    }

    pending.clear();
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

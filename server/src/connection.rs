//! Per-session stream I/O: incremental frame reassembly on the read side,
//! order-preserving coalescing on the write side.
//!
//! Transport errors never tear a session down from here; they mark it
//! unhealthy and the reconciliation pass removes it, so in-flight sends
//! are never raced.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use shared::codec::{decode_payload, FrameHeader};
use shared::{CodecError, HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::session::ClientSession;

/// Bound on one coalesced write. Oversized frames are written alone.
pub const SEND_BUFFER_LEN: usize = 16 * 1024;

/// Read chunk size for the stream reader.
pub const READ_BUFFER_LEN: usize = 8 * 1024;

/// One decoded inbound message tagged with its originating session.
#[derive(Debug)]
pub struct InboundMessage {
    pub index: i32,
    pub kind: i32,
    pub payload: Vec<u8>,
    pub via_datagram: bool,
}

enum ReadState {
    Header { buf: [u8; HEADER_LEN], got: usize },
    Payload { kind: i32, need: usize, got: Vec<u8> },
}

/// Incremental frame parser.
///
/// Feed it whatever the transport produced; it emits one decoded message
/// per completed frame, handling partial reads, several frames per read
/// and frames split across the header/payload boundary.
pub struct FrameReader {
    state: ReadState,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            state: ReadState::Header {
                buf: [0; HEADER_LEN],
                got: 0,
            },
        }
    }

    pub fn feed(
        &mut self,
        mut input: &[u8],
        out: &mut Vec<(i32, Vec<u8>)>,
    ) -> Result<(), CodecError> {
        while !input.is_empty() {
            match &mut self.state {
                ReadState::Header { buf, got } => {
                    let take = (HEADER_LEN - *got).min(input.len());
                    buf[*got..*got + take].copy_from_slice(&input[..take]);
                    *got += take;
                    input = &input[take..];
                    if *got < HEADER_LEN {
                        break;
                    }
                    let header = FrameHeader::parse(buf)?;
                    if header.stored_len == 0 {
                        out.push((header.kind, Vec::new()));
                        self.state = ReadState::Header {
                            buf: [0; HEADER_LEN],
                            got: 0,
                        };
                    } else {
                        self.state = ReadState::Payload {
                            kind: header.kind,
                            need: header.stored_len,
                            got: Vec::with_capacity(header.stored_len),
                        };
                    }
                }
                ReadState::Payload { kind, need, got } => {
                    let take = (*need - got.len()).min(input.len());
                    got.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if got.len() < *need {
                        break;
                    }
                    let payload = decode_payload(got)?;
                    out.push((*kind, payload));
                    self.state = ReadState::Header {
                        buf: [0; HEADER_LEN],
                        got: 0,
                    };
                }
            }
        }
        Ok(())
    }
}

/// Pops queued frames into one bounded batch, preserving order. A frame
/// larger than the limit is returned alone so it still goes out in its
/// queue position.
pub fn coalesce(pending: &mut VecDeque<Vec<u8>>, limit: usize) -> Vec<u8> {
    let mut batch = Vec::new();
    while let Some(front) = pending.front() {
        if !batch.is_empty() && batch.len() + front.len() > limit {
            break;
        }
        let frame = pending.pop_front().unwrap();
        batch.extend_from_slice(&frame);
        if batch.len() >= limit {
            break;
        }
    }
    batch
}

/// Reads the stream, reassembles frames and pushes them into the shared
/// inbound queue tagged with the session index.
pub async fn run_reader(
    mut half: OwnedReadHalf,
    session: Arc<ClientSession>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    mut stop: watch::Receiver<bool>,
) {
    let mut reader = FrameReader::new();
    let mut closed = session.closed_signal();
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    let mut frames = Vec::new();
    loop {
        tokio::select! {
            read = half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        session.mark_unhealthy("connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        session.touch_receive();
                        if let Err(e) = reader.feed(&buf[..n], &mut frames) {
                            // Oversized or malformed frame: abort this
                            // connection, nobody else.
                            warn!("session {}: {}", session.index, e);
                            session.mark_unhealthy(&format!("protocol violation: {}", e));
                            break;
                        }
                        for (kind, payload) in frames.drain(..) {
                            let message = InboundMessage {
                                index: session.index,
                                kind,
                                payload,
                                via_datagram: false,
                            };
                            if inbound.send(message).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        session.mark_unhealthy(&format!("read failed: {}", e));
                        break;
                    }
                }
            }
            _ = closed.changed() => break,
            _ = stop.changed() => break,
        }
    }
    debug!("reader for session {} finished", session.index);
}

/// Drains the session's outbound queue into coalesced writes. Exits on
/// the per-session close signal or the hosting-session stop signal,
/// flushing what is already queued, then shuts the write half down so
/// the peer sees end-of-stream.
pub async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut half: OwnedWriteHalf,
    session: Arc<ClientSession>,
    mut stop: watch::Receiver<bool>,
) {
    let mut closed = session.closed_signal();
    let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
    if !*closed.borrow_and_update() {
        'outer: loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(frame) => pending.push_back(frame),
                        None => break,
                    }
                    // Pick up everything already queued before writing.
                    while let Ok(frame) = rx.try_recv() {
                        pending.push_back(frame);
                    }
                    while !pending.is_empty() {
                        let batch = coalesce(&mut pending, SEND_BUFFER_LEN);
                        if let Err(e) = half.write_all(&batch).await {
                            session.mark_unhealthy(&format!("write failed: {}", e));
                            break 'outer;
                        }
                    }
                }
                _ = closed.changed() => break,
                _ = stop.changed() => break,
            }
        }
    }
    // Best-effort flush of whatever is already queued, goodbye frames
    // included.
    while let Ok(frame) = rx.try_recv() {
        pending.push_back(frame);
    }
    while !pending.is_empty() {
        let batch = coalesce(&mut pending, SEND_BUFFER_LEN);
        if half.write_all(&batch).await.is_err() {
            break;
        }
    }
    let _ = half.shutdown().await;
    debug!("writer for session {} finished", session.index);
}

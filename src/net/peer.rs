// Peer tasks
//
// Each connection runs a reader task plus a paired writer task consuming
// a bounded channel of outbound frames. The reader owns the handshake
// state machine and keep-alive accounting; the writer enforces the write
// deadline. Data messages only flow after the handshake reaches Ready.
//
// State machine: New → VersionSent → VersionReceived → Ready → Closed.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::net::protocol::{FramedReader, FramedWriter, Message, VersionPayload};

pub type PeerId = SocketAddr;

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Two consecutive missed pongs close the peer: the liveness deadline is
/// this many intervals past the last pong, plus one second of grace.
pub const MAX_MISSED_PONGS: u32 = 2;
pub const PONG_GRACE: Duration = Duration::from_secs(1);

/// Outbound frames queued per peer before backpressure kicks in.
pub const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    VersionSent,
    VersionReceived,
    Ready,
    Closed,
}

/// Events the peer tasks feed into the network event loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed; the peer's version payload is attached.
    Ready(PeerId, VersionPayload),
    /// A data message from a Ready peer.
    Message(PeerId, Message),
    /// Connection ended for any reason.
    Closed(PeerId, CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote hung up or I/O failed.
    Gone,
    /// Read idle / write deadline / missing pongs.
    TimedOut,
    /// Protocol violation; the peer should be banned for a cool-down.
    Misbehaved(String),
    /// Our own nonce came back: we dialed ourselves.
    SelfConnect,
    /// Local shutdown.
    Shutdown,
}

/// Writer half: drains the outbound queue under the write deadline.
async fn writer_loop(
    mut writer: FramedWriter<tokio::net::tcp::OwnedWriteHalf>,
    mut outbound: mpsc::Receiver<Message>,
) -> CloseReason {
    while let Some(msg) = outbound.recv().await {
        match tokio::time::timeout(WRITE_DEADLINE, writer.send(&msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return CloseReason::Gone,
            Err(_) => return CloseReason::TimedOut,
        }
    }
    CloseReason::Shutdown
}

pub struct PeerTask {
    pub id: PeerId,
    pub is_outbound: bool,
    /// Version payload this node introduces itself with.
    pub our_version: VersionPayload,
    /// Nonce set for self-connect detection.
    pub our_nonce: u64,
    /// Keep-alive cadence; PING_INTERVAL outside tests.
    pub ping_interval: Duration,
    pub events: mpsc::Sender<PeerEvent>,
    pub shutdown: watch::Receiver<bool>,
}

impl PeerTask {
    /// Drive one connection to completion. Returns when the peer closes.
    /// The caller keeps a clone of `out_tx` to queue outbound frames.
    pub async fn run(
        mut self,
        stream: TcpStream,
        out_tx: mpsc::Sender<Message>,
        out_rx: mpsc::Receiver<Message>,
    ) {
        let id = self.id;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedReader::new(read_half);
        let writer = FramedWriter::new(write_half);

        let mut writer_task = tokio::spawn(writer_loop(writer, out_rx));

        let reason = self
            .reader_loop(&mut reader, &out_tx)
            .await;

        // Dropping the sender ends the writer; give it a moment to flush
        drop(out_tx);
        let _ = tokio::time::timeout(WRITE_DEADLINE, &mut writer_task).await;
        writer_task.abort();

        debug!(target: "net", peer = %id, ?reason, "peer closed");
        let _ = self.events.send(PeerEvent::Closed(id, reason)).await;
    }

    async fn reader_loop(
        &mut self,
        reader: &mut FramedReader<tokio::net::tcp::OwnedReadHalf>,
        out: &mpsc::Sender<Message>,
    ) -> CloseReason {
        let id = self.id;

        // Both sides introduce themselves immediately: New → VersionSent
        if out.send(Message::Version(self.our_version.clone())).await.is_err() {
            return CloseReason::Gone;
        }
        let mut state = PeerState::VersionSent;

        let handshake_deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        let mut ping_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        let mut ping_nonce: u64 = rand::random();
        let mut awaiting_pong = false;
        // Liveness reference: the last pong, or handshake completion
        let mut last_pong = tokio::time::Instant::now();
        let mut peer_version: Option<VersionPayload> = None;

        loop {
            let pong_deadline = last_pong + self.ping_interval * MAX_MISSED_PONGS + PONG_GRACE;
            tokio::select! {
                _ = self.shutdown.changed() => {
                    return CloseReason::Shutdown;
                }
                _ = tokio::time::sleep_until(handshake_deadline), if state != PeerState::Ready => {
                    return CloseReason::TimedOut;
                }
                _ = tokio::time::sleep_until(pong_deadline), if state == PeerState::Ready && awaiting_pong => {
                    return CloseReason::TimedOut;
                }
                _ = ping_timer.tick() => {
                    if state != PeerState::Ready {
                        continue;
                    }
                    ping_nonce = ping_nonce.wrapping_add(1);
                    awaiting_pong = true;
                    if out.send(Message::Ping(ping_nonce)).await.is_err() {
                        return CloseReason::Gone;
                    }
                }
                received = tokio::time::timeout(READ_IDLE_TIMEOUT, reader.recv()) => {
                    let msg = match received {
                        Err(_) => return CloseReason::TimedOut,
                        Ok(Err(e)) => return CloseReason::Misbehaved(e.to_string()),
                        Ok(Ok(None)) => return CloseReason::Gone,
                        Ok(Ok(Some(msg))) => msg,
                    };

                    match (msg, state) {
                        (Message::Version(v), PeerState::VersionSent) => {
                            if v.nonce == self.our_nonce {
                                return CloseReason::SelfConnect;
                            }
                            trace!(target: "net", peer = %id, heights = ?(v.golden_height, v.silver_height), "version received");
                            peer_version = Some(v);
                            if out.send(Message::Verack).await.is_err() {
                                return CloseReason::Gone;
                            }
                            state = PeerState::VersionReceived;
                        }
                        (Message::Verack, PeerState::VersionReceived) => {
                            state = PeerState::Ready;
                            last_pong = tokio::time::Instant::now();
                            let version = peer_version.clone().expect("version set before verack");
                            if self
                                .events
                                .send(PeerEvent::Ready(id, version))
                                .await
                                .is_err()
                            {
                                return CloseReason::Shutdown;
                            }
                        }
                        // Per-peer ordering guarantees version precedes
                        // verack; anything else is out of order.
                        (Message::Verack, PeerState::VersionSent) => {
                            warn!(target: "net", peer = %id, "verack before version");
                            return CloseReason::Misbehaved("verack before version".into());
                        }
                        (Message::Version(_), _) => {
                            return CloseReason::Misbehaved("duplicate version".into());
                        }
                        (Message::Ping(nonce), PeerState::Ready) => {
                            if out.send(Message::Pong(nonce)).await.is_err() {
                                return CloseReason::Gone;
                            }
                        }
                        (Message::Pong(nonce), PeerState::Ready) => {
                            if nonce == ping_nonce {
                                awaiting_pong = false;
                                last_pong = tokio::time::Instant::now();
                            }
                        }
                        (msg, PeerState::Ready) => {
                            if self
                                .events
                                .send(PeerEvent::Message(id, msg))
                                .await
                                .is_err()
                            {
                                return CloseReason::Shutdown;
                            }
                        }
                        (msg, _) => {
                            return CloseReason::Misbehaved(format!(
                                "{} before handshake completed",
                                msg.command()
                            ));
                        }
                    }
                }
            }
        }
    }
}

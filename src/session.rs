// Upstream session: one proxied TCP stream multiplexed inside a tunnel.
//
// A session is spawned as its own task when an INIT frame names a session id
// the tunnel hasn't seen before. It owns the upstream socket, drains queued
// payload into it once connected, and reports upstream bytes and its own
// closure back to the tunnel task through channels.

use crate::codec::{encode_frame, Atyp, Cmd, InitBody};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

/// Errors specific to a single session's lifecycle. These never bring down
/// the tunnel; a session that fails simply closes itself.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unsupported address type (IPv6)")]
    UnsupportedAddressFamily,

    #[error("malformed INIT address: expected {expected} bytes, got {got}")]
    MalformedAddress { expected: usize, got: usize },

    #[error("name resolution failed: {0}")]
    Resolve(#[source] std::io::Error),

    #[error("name resolution returned no addresses")]
    NoAddresses,

    #[error("upstream connect failed: {0}")]
    Connect(#[source] std::io::Error),
}

/// Commands sent from the tunnel task to a session task.
enum SessionCommand {
    /// Payload bytes to forward upstream (from a NORMAL frame).
    Data(Bytes),
    /// The peer sent CLOSE for this session.
    PeerClose,
}

/// A handle the tunnel's session table holds for a live session.
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Forward payload bytes upstream. Errors if the session has already
    /// torn itself down (its command channel is closed); callers should
    /// treat that the same as "unknown session" for NORMAL frames.
    pub async fn send_data(&self, payload: Bytes) -> Result<(), ()> {
        self.cmd_tx
            .send(SessionCommand::Data(payload))
            .await
            .map_err(|_| ())
    }

    /// Notify the session that the peer sent CLOSE for it.
    pub async fn send_peer_close(&self) -> Result<(), ()> {
        self.cmd_tx
            .send(SessionCommand::PeerClose)
            .await
            .map_err(|_| ())
    }

    /// A handle with no backing task, for tests that only exercise the
    /// session table and never actually send a command through it.
    #[cfg(test)]
    pub fn new_for_test() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { cmd_tx: tx }
    }
}

/// Spawn a new upstream session task for `session_id`, seeded with the
/// address/payload carried in `init`.
///
/// `outbound` is the shared channel into the tunnel's single writer task;
/// `done` notifies the tunnel's control loop that `session_id` has torn
/// itself down and should be removed from the session table.
pub fn spawn(
    session_id: u32,
    init: InitBody,
    outbound: mpsc::Sender<Bytes>,
    done: mpsc::UnboundedSender<u32>,
    idle_timeout: Duration,
) -> Result<SessionHandle, SessionError> {
    if init.atyp == Atyp::Ipv6 {
        return Err(SessionError::UnsupportedAddressFamily);
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let mut pending = VecDeque::new();
    if !init.payload.is_empty() {
        pending.push_back(init.payload.clone());
    }

    let actor = SessionActor {
        session_id,
        atyp: init.atyp,
        addr: init.addr,
        port: init.port,
        pending,
        cmd_rx,
        outbound,
        done,
        idle_timeout,
        ctl_cmd: Cmd::Normal,
    };

    tokio::spawn(actor.run());

    Ok(SessionHandle { cmd_tx })
}

struct SessionActor {
    session_id: u32,
    atyp: Atyp,
    addr: Bytes,
    port: u16,
    pending: VecDeque<Bytes>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    outbound: mpsc::Sender<Bytes>,
    done: mpsc::UnboundedSender<u32>,
    idle_timeout: Duration,
    ctl_cmd: Cmd,
}

impl SessionActor {
    fn resolve_literal(&self) -> Result<SocketAddr, SessionError> {
        if self.addr.len() != 4 {
            return Err(SessionError::MalformedAddress {
                expected: 4,
                got: self.addr.len(),
            });
        }
        let ip = Ipv4Addr::new(self.addr[0], self.addr[1], self.addr[2], self.addr[3]);
        Ok(SocketAddr::new(IpAddr::V4(ip), self.port))
    }

    /// Resolve a DNS name while remaining responsive to commands arriving
    /// before resolution completes (in particular, a peer CLOSE).
    async fn resolve_name(&mut self) -> Result<SocketAddr, SessionError> {
        let name = String::from_utf8_lossy(&self.addr).into_owned();
        let query = format!("{name}:{}", self.port);
        let lookup = tokio::net::lookup_host(query);
        tokio::pin!(lookup);
        let mut channel_open = true;

        loop {
            tokio::select! {
                result = &mut lookup => {
                    let mut addrs = result.map_err(SessionError::Resolve)?;
                    return addrs.next().ok_or(SessionError::NoAddresses);
                }
                cmd = self.cmd_rx.recv(), if channel_open => {
                    channel_open = self.handle_command_during_setup(cmd);
                }
            }
        }
    }

    /// Returns whether the command channel is still open.
    fn handle_command_during_setup(&mut self, cmd: Option<SessionCommand>) -> bool {
        match cmd {
            Some(SessionCommand::Data(payload)) => {
                self.pending.push_back(payload);
                true
            }
            Some(SessionCommand::PeerClose) => {
                self.ctl_cmd = Cmd::Close;
                true
            }
            None => false,
        }
    }

    /// Resolve `self.addr` per `self.atyp`, without applying the idle
    /// deadline (the caller races this against it).
    async fn resolve(&mut self) -> Result<SocketAddr, SessionError> {
        if self.atyp == Atyp::DomainName {
            self.resolve_name().await
        } else {
            self.resolve_literal()
        }
    }

    async fn run(mut self) {
        // Armed here, not in `pump`, so a hung resolve or a stalled connect
        // can't pin a session open forever: the idle deadline covers the
        // whole lifetime of the session, from creation through teardown.
        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        let addr = tokio::select! {
            _ = &mut idle => {
                tracing::debug!(session_id = self.session_id, "idle timeout during resolve");
                self.finish().await;
                return;
            }
            result = self.resolve() => match result {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::warn!(session_id = self.session_id, error = %e, "resolve failed");
                    self.finish().await;
                    return;
                }
            },
        };

        if self.ctl_cmd == Cmd::Close {
            tracing::debug!(session_id = self.session_id, "closed before connect");
            self.finish().await;
            return;
        }

        let stream = tokio::select! {
            _ = &mut idle => {
                tracing::debug!(session_id = self.session_id, "idle timeout during connect");
                self.finish().await;
                return;
            }
            result = TcpStream::connect(addr) => match result.map_err(SessionError::Connect) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(session_id = self.session_id, error = %e, "connect failed");
                    self.finish().await;
                    return;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(session_id = self.session_id, error = %e, "set_nodelay failed");
        }
        tracing::debug!(session_id = self.session_id, peer = %addr, "connected");

        let (mut read_half, mut write_half) = stream.into_split();

        for payload in std::mem::take(&mut self.pending) {
            if let Err(e) = write_half.write_all(&payload).await {
                tracing::warn!(session_id = self.session_id, error = %e, "upstream write failed");
                self.finish().await;
                return;
            }
        }

        self.pump(&mut read_half, &mut write_half, idle.as_mut()).await;
        self.finish().await;
    }

    async fn pump(
        &mut self,
        read_half: &mut tokio::net::tcp::OwnedReadHalf,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        mut idle: Pin<&mut Sleep>,
    ) {
        let mut buf = [0u8; 8192];

        loop {
            tokio::select! {
                _ = &mut idle => {
                    tracing::debug!(session_id = self.session_id, "idle timeout");
                    self.ctl_cmd = Cmd::Normal;
                    return;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Data(payload)) => {
                            if let Err(e) = write_half.write_all(&payload).await {
                                tracing::warn!(session_id = self.session_id, error = %e, "upstream write failed");
                                self.ctl_cmd = Cmd::Normal;
                                return;
                            }
                            idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        }
                        Some(SessionCommand::PeerClose) => {
                            self.ctl_cmd = Cmd::Close;
                            return;
                        }
                        None => {
                            // Tunnel is gone; no peer left to notify.
                            self.ctl_cmd = Cmd::Normal;
                            return;
                        }
                    }
                }
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!(session_id = self.session_id, "upstream eof");
                            self.ctl_cmd = Cmd::Normal;
                            return;
                        }
                        Ok(n) => {
                            let frame = encode_frame(self.session_id, Cmd::Normal, &buf[..n]);
                            if self.outbound.send(frame).await.is_err() {
                                return;
                            }
                            idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        }
                        Err(e) => {
                            tracing::warn!(session_id = self.session_id, error = %e, "upstream read failed");
                            self.ctl_cmd = Cmd::Normal;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Emit the closing frame appropriate to how this session ended and
    /// tell the tunnel to drop its table entry. If the outbound channel is
    /// already gone the tunnel itself is tearing down and no frame is sent.
    async fn finish(&self) {
        let reply_cmd = match self.ctl_cmd {
            Cmd::Close => Cmd::CloseAck,
            _ => Cmd::Close,
        };
        let frame = encode_frame(self.session_id, reply_cmd, &[]);
        let _ = self.outbound.send(frame).await;
        let _ = self.done.send(self.session_id);
    }
}

// Tunnel server: the demultiplexer/multiplexer running for one client
// connection. Owns the session table, the incremental frame reader, and
// the outbound write path shared by every session task it spawns.

use crate::codec::{encode_frame, CodecError, Cmd, Header, InitBody, HEADER_SIZE};
use crate::config::Config;
use crate::session;
use crate::table::SessionTable;
use bytes::{Bytes, BytesMut};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Conditions that bring the whole tunnel down, as opposed to a single
/// session closing on its own.
#[derive(Debug, Error)]
enum TunnelFatal {
    #[error("duplicate INIT for session {0}")]
    DuplicateSession(u32),
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
    #[error("tunnel read error: {0}")]
    Read(#[source] std::io::Error),
    #[error("tunnel write error: {0}")]
    Write(#[source] std::io::Error),
}

/// Drive one accepted tunnel connection to completion. Returns once the
/// peer disconnects or a tunnel-fatal error occurs; never returns early
/// for per-session trouble.
pub async fn run(stream: TcpStream, config: Arc<Config>) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(error = %e, "failed to set TCP_NODELAY on tunnel socket");
    }
    let peer = stream.peer_addr().ok();
    let (mut read_half, mut write_half) = stream.into_split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(256);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u32>();

    let mut tunnel = Tunnel {
        config,
        table: SessionTable::new(),
        reasm: BytesMut::with_capacity(8 * 1024),
    };

    let mut read_buf = [0u8; 8 * 1024];
    let fatal: Option<TunnelFatal> = 'outer: loop {
        tokio::select! {
            result = read_half.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!(?peer, "tunnel closed by peer");
                        break 'outer None;
                    }
                    Ok(n) => {
                        tunnel.reasm.extend_from_slice(&read_buf[..n]);
                        loop {
                            match tunnel.try_parse_frame() {
                                Ok(Some((header, body))) => {
                                    if let Err(e) = tunnel
                                        .dispatch(header, body, &mut write_half, &outbound_tx, &done_tx)
                                        .await
                                    {
                                        break 'outer Some(e);
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => break 'outer Some(e.into()),
                            }
                        }
                    }
                    Err(e) => break 'outer Some(TunnelFatal::Read(e)),
                }
            }
            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = write_half.write_all(&frame).await {
                    break 'outer Some(TunnelFatal::Write(e));
                }
            }
            Some(finished_id) = done_rx.recv() => {
                tunnel.table.remove(finished_id);
            }
        }
    };

    if let Some(e) = &fatal {
        tracing::warn!(?peer, error = %e, "tunnel torn down");
    }
    // Dropping the table drops every SessionHandle, closing each session's
    // command channel; session tasks observe that on their next poll and
    // exit without emitting a close frame (the tunnel is gone).
    let remaining = tunnel.table.len();
    if remaining > 0 {
        tracing::debug!(?peer, remaining, "releasing sessions on tunnel teardown");
    }
    drop(tunnel.table);
}

struct Tunnel {
    config: Arc<Config>,
    table: SessionTable,
    reasm: BytesMut,
}

impl Tunnel {
    /// Pull one complete frame out of the reassembly buffer, if present.
    fn try_parse_frame(&mut self) -> Result<Option<(Header, Bytes)>, CodecError> {
        if self.reasm.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.reasm[..HEADER_SIZE]);
        let header = Header::decode(&mut cursor)?;

        let total = HEADER_SIZE + header.datalen as usize;
        if self.reasm.len() < total {
            return Ok(None);
        }

        let mut frame_bytes = self.reasm.split_to(total);
        let body = frame_bytes.split_off(HEADER_SIZE).freeze();
        Ok(Some((header, body)))
    }

    async fn dispatch(
        &mut self,
        header: Header,
        body: Bytes,
        write_half: &mut OwnedWriteHalf,
        outbound_tx: &mpsc::Sender<Bytes>,
        done_tx: &mpsc::UnboundedSender<u32>,
    ) -> Result<(), TunnelFatal> {
        match header.cmd {
            Cmd::Normal => {
                if let Some(handle) = self.table.find(header.session_id) {
                    if handle.send_data(body).await.is_err() {
                        tracing::debug!(
                            session_id = header.session_id,
                            "session gone, dropping NORMAL payload"
                        );
                    }
                } else {
                    tracing::debug!(
                        session_id = header.session_id,
                        "dropping NORMAL for unknown session"
                    );
                }
                Ok(())
            }
            Cmd::Init => self
                .handle_init(header.session_id, body, write_half, outbound_tx, done_tx)
                .await,
            Cmd::Close => {
                if let Some(handle) = self.table.find(header.session_id) {
                    let _ = handle.send_peer_close().await;
                } else {
                    let frame = encode_frame(header.session_id, Cmd::CloseAck, &[]);
                    write_half.write_all(&frame).await.map_err(TunnelFatal::Write)?;
                }
                Ok(())
            }
            Cmd::CloseAck => {
                tracing::trace!(session_id = header.session_id, "received CLOSE_ACK");
                Ok(())
            }
        }
    }

    async fn handle_init(
        &mut self,
        session_id: u32,
        body: Bytes,
        write_half: &mut OwnedWriteHalf,
        outbound_tx: &mpsc::Sender<Bytes>,
        done_tx: &mpsc::UnboundedSender<u32>,
    ) -> Result<(), TunnelFatal> {
        if self.table.find(session_id).is_some() {
            return Err(TunnelFatal::DuplicateSession(session_id));
        }

        let init = match InitBody::decode(&body) {
            Ok(init) => init,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "malformed INIT body, closing");
                let frame = encode_frame(session_id, Cmd::Close, &[]);
                write_half.write_all(&frame).await.map_err(TunnelFatal::Write)?;
                return Ok(());
            }
        };

        match session::spawn(
            session_id,
            init,
            outbound_tx.clone(),
            done_tx.clone(),
            self.config.idle_timeout,
        ) {
            Ok(handle) => {
                self.table
                    .insert(session_id, handle)
                    .expect("presence already checked above");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "session creation refused, closing");
                let frame = encode_frame(session_id, Cmd::Close, &[]);
                write_half.write_all(&frame).await.map_err(TunnelFatal::Write)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Atyp;
    use std::net::TcpListener as StdTcpListener;
    use tokio::net::TcpListener;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            idle_timeout: std::time::Duration::from_secs(30),
            ..Config::default()
        })
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (connect, accept) = tokio::join!(connect, accept);
        (connect.unwrap(), accept.unwrap().0)
    }

    #[tokio::test]
    async fn s1_single_ipv4_session_happy_path() {
        let upstream_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        upstream_listener.set_nonblocking(true).unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        let upstream_listener = TcpListener::from_std(upstream_listener).unwrap();

        let (client_side, server_side) = loopback_pair().await;
        let config = test_config();
        let tunnel_task = tokio::spawn(run(server_side, config));

        let mut client_side = client_side;

        let octets = match upstream_addr.ip() {
            std::net::IpAddr::V4(v4) => v4.octets(),
            _ => panic!("expected ipv4"),
        };
        let body = InitBody {
            atyp: Atyp::Ipv4,
            addr: Bytes::copy_from_slice(&octets),
            port: upstream_addr.port(),
            payload: Bytes::from_static(b"GE"),
        }
        .encode();
        let init_frame = encode_frame(1, Cmd::Init, &body);
        client_side.write_all(&init_frame).await.unwrap();

        let (mut upstream, _) = upstream_listener.accept().await.unwrap();
        let mut got = [0u8; 2];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"GE");

        upstream.write_all(b"OK").await.unwrap();

        let mut response = [0u8; HEADER_SIZE + 2];
        client_side.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, encode_frame(1, Cmd::Normal, b"OK").as_ref());

        let close_frame = encode_frame(1, Cmd::Close, &[]);
        client_side.write_all(&close_frame).await.unwrap();

        let mut ack = [0u8; HEADER_SIZE];
        client_side.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, encode_frame(1, Cmd::CloseAck, &[]).as_ref());

        drop(client_side);
        let _ = tunnel_task.await;
    }

    #[tokio::test]
    async fn s4_unknown_normal_is_dropped() {
        let (mut client_side, server_side) = loopback_pair().await;
        let config = test_config();
        let tunnel_task = tokio::spawn(run(server_side, config));

        let frame = encode_frame(0xFF, Cmd::Normal, b"ABC");
        client_side.write_all(&frame).await.unwrap();

        // Nothing should come back; confirm by racing a close handshake on
        // a different, legitimate path.
        let ping = encode_frame(0xFE, Cmd::Close, &[]);
        client_side.write_all(&ping).await.unwrap();

        let mut ack = [0u8; HEADER_SIZE];
        client_side.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, encode_frame(0xFE, Cmd::CloseAck, &[]).as_ref());

        drop(client_side);
        let _ = tunnel_task.await;
    }

    #[tokio::test]
    async fn s5_unknown_close_acks() {
        let (mut client_side, server_side) = loopback_pair().await;
        let config = test_config();
        let tunnel_task = tokio::spawn(run(server_side, config));

        let frame = encode_frame(0xFE, Cmd::Close, &[]);
        client_side.write_all(&frame).await.unwrap();

        let mut ack = [0u8; HEADER_SIZE];
        client_side.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, encode_frame(0xFE, Cmd::CloseAck, &[]).as_ref());

        drop(client_side);
        let _ = tunnel_task.await;
    }

    #[tokio::test]
    async fn s7_fragmented_header_and_body_reassemble() {
        let upstream_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        upstream_listener.set_nonblocking(true).unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        let upstream_listener = TcpListener::from_std(upstream_listener).unwrap();

        let (mut client_side, server_side) = loopback_pair().await;
        let config = test_config();
        let tunnel_task = tokio::spawn(run(server_side, config));

        let octets = match upstream_addr.ip() {
            std::net::IpAddr::V4(v4) => v4.octets(),
            _ => panic!("expected ipv4"),
        };
        let body = InitBody {
            atyp: Atyp::Ipv4,
            addr: Bytes::copy_from_slice(&octets),
            port: upstream_addr.port(),
            payload: Bytes::from_static(b"GE"),
        }
        .encode();
        let frame = encode_frame(1, Cmd::Init, &body);

        // header in one write, body split 3 + 7 across two more writes.
        client_side.write_all(&frame[..HEADER_SIZE]).await.unwrap();
        client_side.write_all(&frame[HEADER_SIZE..HEADER_SIZE + 3]).await.unwrap();
        client_side.write_all(&frame[HEADER_SIZE + 3..]).await.unwrap();

        let (mut upstream, _) = upstream_listener.accept().await.unwrap();
        let mut got = [0u8; 2];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"GE");

        drop(client_side);
        let _ = tunnel_task.await;
    }
}

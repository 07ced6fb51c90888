//! `ProtocolEngine` (ServerSide): the state machine that owns an
//! inbound connection from a peer, per `spec.md` §4.4.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{ProtocolError, RelayError, TimeoutError};
use crate::frame::{Command, Frame, FrameCodec};
use crate::queue::{Watermark, WatermarkQueue};
use crate::translate::Message;

use super::{header_value, negotiate, parse_heart_beat, PauseGate, WriteItem};
use super::client::HeartBeats;

const READ_BUF_SIZE: usize = 8192;

/// Connection-time parameters for a server-role engine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hb_send: u64,
    pub hb_recv: u64,
    pub max_network_delay: Duration,
    pub send_capacity: usize,
    pub recv_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hb_send: 0,
            hb_recv: 0,
            max_network_delay: super::DEFAULT_MAX_NETWORK_DELAY,
            send_capacity: 16,
            recv_capacity: 16,
        }
    }
}

/// A running server-role connection.
pub struct ServerConnection {
    pub send_queue: Arc<WatermarkQueue<WriteItem<String>>>,
    pub recv_queue: Arc<WatermarkQueue<Message>>,
    pub heart_beats: HeartBeats,
    pub pause_gate: Arc<PauseGate>,
    writer_task: JoinHandle<Result<(), RelayError>>,
    reader_task: JoinHandle<Result<(), RelayError>>,
}

impl ServerConnection {
    pub async fn join(self) -> Result<(), RelayError> {
        let (w, r) = tokio::join!(self.writer_task, self.reader_task);
        w.expect("writer task panicked")?;
        r.expect("reader task panicked")?;
        Ok(())
    }
}

/// Wait for the peer's `CONNECT`, reply `CONNECTED`, and spawn the
/// writer and reader tasks. `transport` must already be a live,
/// authenticated byte stream.
pub async fn accept<T>(transport: T, cfg: ServerConfig) -> Result<ServerConnection, RelayError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(transport);
    let mut codec = FrameCodec::default();

    let heart_beats = read_connect(&mut reader, &mut codec, &cfg).await?;

    let connected = Frame::new(
        Command::Connected,
        vec![
            ("version".to_owned(), "1.2".to_owned()),
            (
                "heart-beat".to_owned(),
                format!("{},{}", heart_beats.hb_send, heart_beats.hb_recv),
            ),
            ("session".to_owned(), uuid::Uuid::new_v4().to_string()),
        ],
        Vec::new(),
    );
    writer.write_all(&connected.encode()).await?;

    let send_queue = WatermarkQueue::new(cfg.send_capacity);
    let recv_queue = WatermarkQueue::new(cfg.recv_capacity);
    let pause_gate = Arc::new(PauseGate::new());

    let writer_task = tokio::spawn(writer_loop(writer, send_queue.clone(), heart_beats.hb_send));
    let reader_task = tokio::spawn(reader_loop(
        reader,
        codec,
        recv_queue.clone(),
        pause_gate.clone(),
        heart_beats.hb_recv,
        cfg.max_network_delay,
    ));

    Ok(ServerConnection {
        send_queue,
        recv_queue,
        heart_beats,
        pause_gate,
        writer_task,
        reader_task,
    })
}

async fn read_connect<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &mut FrameCodec,
    cfg: &ServerConfig,
) -> Result<HeartBeats, RelayError> {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = timeout(cfg.max_network_delay, reader.read(&mut buf))
            .await
            .map_err(|_| TimeoutError::Handshake(cfg.max_network_delay))??;
        if n == 0 {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            ))
            .into());
        }
        codec.feed(&buf[..n]);
        for frame in codec.drain_frames()? {
            match frame {
                Frame::Heartbeat => continue,
                Frame::Command {
                    command: Command::Connect,
                    headers,
                    ..
                } => {
                    let accept_version =
                        header_value(&headers, "accept-version").ok_or(ProtocolError::MissingHeader("accept-version"))?;
                    if !accept_version.split(',').any(|v| v.trim() == "1.2") {
                        return Err(ProtocolError::UnsupportedVersion(accept_version.to_owned()).into());
                    }
                    header_value(&headers, "host").ok_or(ProtocolError::MissingHeader("host"))?;
                    let (peer_sx, peer_sy) = parse_heart_beat(header_value(&headers, "heart-beat").unwrap_or("0,0"))?;
                    return Ok(HeartBeats {
                        hb_send: negotiate(cfg.hb_send, peer_sx),
                        hb_recv: negotiate(cfg.hb_recv, peer_sy),
                    });
                }
                Frame::Command { command, .. } => {
                    return Err(ProtocolError::UnexpectedCommand(command.as_str().to_owned()).into());
                }
            }
        }
    }
}

async fn writer_loop(
    writer: WriteHalf<impl AsyncWrite>,
    send_queue: Arc<WatermarkQueue<WriteItem<String>>>,
    hb_send: u64,
) -> Result<(), RelayError> {
    let result = writer_loop_inner(writer, send_queue.clone(), hb_send).await;
    send_queue.close();
    result
}

async fn writer_loop_inner(
    mut writer: WriteHalf<impl AsyncWrite>,
    send_queue: Arc<WatermarkQueue<WriteItem<String>>>,
    hb_send: u64,
) -> Result<(), RelayError> {
    loop {
        let item = if hb_send > 0 {
            match timeout(Duration::from_millis(hb_send), send_queue.get()).await {
                Ok(item) => item,
                Err(_) => {
                    writer.write_all(b"\n").await?;
                    continue;
                }
            }
        } else {
            send_queue.get().await
        };

        let Some(item) = item else {
            return Ok(());
        };
        send_queue.task_done();

        match item {
            WriteItem::Item(receipt_id) => {
                let frame = Frame::new(Command::Receipt, vec![("receipt-id".to_owned(), receipt_id)], Vec::new());
                writer.write_all(&frame.encode()).await?;
            }
            WriteItem::Close => {
                return Ok(());
            }
            WriteItem::Error(e) => {
                let headers = vec![("message".to_owned(), e.message.clone())];
                let body = e.context.unwrap_or_default();
                let frame = Frame::new(Command::Error, headers, body);
                writer.write_all(&frame.encode()).await?;
                return Ok(());
            }
        }
    }
}

async fn reader_loop(
    reader: ReadHalf<impl AsyncRead>,
    codec: FrameCodec,
    recv_queue: Arc<WatermarkQueue<Message>>,
    pause_gate: Arc<PauseGate>,
    hb_recv: u64,
    max_network_delay: Duration,
) -> Result<(), RelayError> {
    let result = reader_loop_inner(reader, codec, recv_queue.clone(), pause_gate, hb_recv, max_network_delay).await;
    recv_queue.close();
    result
}

async fn reader_loop_inner(
    mut reader: ReadHalf<impl AsyncRead>,
    mut codec: FrameCodec,
    recv_queue: Arc<WatermarkQueue<Message>>,
    pause_gate: Arc<PauseGate>,
    hb_recv: u64,
    max_network_delay: Duration,
) -> Result<(), RelayError> {
    let watchdog_timeout = Duration::from_millis(hb_recv) + max_network_delay;
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        pause_gate.wait_if_paused().await;

        let n = if hb_recv > 0 {
            match timeout(watchdog_timeout, reader.read(&mut buf)).await {
                Ok(r) => r?,
                Err(_) => return Err(TimeoutError::Heartbeat(watchdog_timeout).into()),
            }
        } else {
            reader.read(&mut buf).await?
        };
        if n == 0 {
            return Ok(());
        }

        codec.feed(&buf[..n]);
        for frame in codec.drain_frames()? {
            match frame {
                Frame::Heartbeat => {}
                Frame::Command {
                    command: Command::Send,
                    headers,
                    body,
                } => {
                    let id = header_value(&headers, "receipt")
                        .ok_or(ProtocolError::MissingHeader("receipt"))?
                        .to_owned();
                    let content_type = header_value(&headers, "content-type")
                        .ok_or(ProtocolError::MissingHeader("content-type"))?
                        .to_owned();
                    let message_type = header_value(&headers, "message-type")
                        .map(str::to_owned)
                        .or_else(|| header_value(&headers, "destination").map(str::to_owned))
                        .ok_or(ProtocolError::MissingHeader("message-type"))?;

                    let message = Message { id, message_type, content_type, body };
                    if let Some(Watermark::High) = recv_queue.put(message).await {
                        pause_gate.pause();
                    }
                }
                Frame::Command {
                    command: Command::Disconnect,
                    ..
                } => {
                    return Ok(());
                }
                Frame::Command { command, .. } => {
                    return Err(ProtocolError::UnexpectedCommand(command.as_str().to_owned()).into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_replies_connected_and_forwards_send() {
        let (client_io, mut server_io) = tokio::io::duplex(4096);
        let cfg = ServerConfig::default();

        let client_task = tokio::spawn(async move {
            let connect = Frame::new(
                Command::Connect,
                vec![
                    ("accept-version".to_owned(), "1.2".to_owned()),
                    ("host".to_owned(), "relay".to_owned()),
                    ("heart-beat".to_owned(), "0,0".to_owned()),
                ],
                Vec::new(),
            );
            server_io.write_all(&connect.encode()).await.unwrap();

            let mut buf = [0u8; 4096];
            let n = server_io.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"CONNECTED\n"));

            let send = Frame::new(
                Command::Send,
                vec![
                    ("destination".to_owned(), "/exchange/x".to_owned()),
                    ("content-type".to_owned(), "application/json".to_owned()),
                    ("message-type".to_owned(), "AccountPurge".to_owned()),
                    ("receipt".to_owned(), "r1".to_owned()),
                ],
                b"{}".to_vec(),
            );
            server_io.write_all(&send.encode()).await.unwrap();
            server_io
        });

        let conn = accept(client_io, cfg).await.unwrap();
        let message = conn.recv_queue.get().await.unwrap();
        assert_eq!(message.id, "r1");
        assert_eq!(message.message_type, "AccountPurge");

        client_task.await.unwrap();
    }
}

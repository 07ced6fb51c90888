//! `ProtocolEngine` (ClientSide): the state machine that owns an
//! outbound connection to a peer, per `spec.md` §4.3.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{ProtocolError, RelayError, ServerError, TimeoutError};
use crate::frame::{Command, Frame, FrameCodec};
use crate::queue::{Watermark, WatermarkQueue};
use crate::translate::Message;

use super::{header_value, negotiate, parse_heart_beat, PauseGate, WriteItem};

const READ_BUF_SIZE: usize = 8192;

/// The heartbeat intervals negotiated during the `CONNECT`/`CONNECTED`
/// handshake, in milliseconds; `0` means disabled.
#[derive(Debug, Clone, Copy)]
pub struct HeartBeats {
    pub hb_send: u64,
    pub hb_recv: u64,
}

/// Connection-time parameters for a client-role engine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub send_destination: String,
    pub hb_send_min: u64,
    pub hb_recv_desired: u64,
    pub max_network_delay: Duration,
    pub send_capacity: usize,
    pub recv_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: String::new(),
            send_destination: String::new(),
            hb_send_min: 0,
            hb_recv_desired: 0,
            max_network_delay: super::DEFAULT_MAX_NETWORK_DELAY,
            send_capacity: 16,
            recv_capacity: 16,
        }
    }
}

/// A running client-role connection: the queues the relay loop talks
/// through, plus the writer/reader task handles.
pub struct ClientConnection {
    pub send_queue: Arc<WatermarkQueue<WriteItem<Message>>>,
    pub recv_queue: Arc<WatermarkQueue<String>>,
    pub heart_beats: HeartBeats,
    pub pause_gate: Arc<PauseGate>,
    writer_task: JoinHandle<Result<(), RelayError>>,
    reader_task: JoinHandle<Result<(), RelayError>>,
}

impl ClientConnection {
    /// Wait for both the writer and reader tasks to finish, e.g. after
    /// pushing `WriteItem::Close` onto the send-queue.
    pub async fn join(self) -> Result<(), RelayError> {
        let (w, r) = tokio::join!(self.writer_task, self.reader_task);
        w.expect("writer task panicked")?;
        r.expect("reader task panicked")?;
        Ok(())
    }
}

/// Perform the `CONNECT`/`CONNECTED` handshake and spawn the writer and
/// reader tasks. `transport` must already be a live, authenticated
/// (e.g. post-TLS-handshake) byte stream.
pub async fn connect<T>(transport: T, cfg: ClientConfig) -> Result<ClientConnection, RelayError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(transport);

    let connect_frame = Frame::new(
        Command::Connect,
        vec![
            ("accept-version".to_owned(), "1.2".to_owned()),
            ("host".to_owned(), cfg.host.clone()),
            (
                "heart-beat".to_owned(),
                format!("{},{}", cfg.hb_send_min, cfg.hb_recv_desired),
            ),
        ],
        Vec::new(),
    );
    writer.write_all(&connect_frame.encode()).await?;

    let mut codec = FrameCodec::default();
    let heart_beats = read_connected(&mut reader, &mut codec, &cfg).await?;

    let send_queue = WatermarkQueue::new(cfg.send_capacity);
    let recv_queue = WatermarkQueue::new(cfg.recv_capacity);
    let pause_gate = Arc::new(PauseGate::new());

    let writer_task = tokio::spawn(writer_loop(
        writer,
        send_queue.clone(),
        cfg.send_destination.clone(),
        heart_beats.hb_send,
    ));
    let reader_task = tokio::spawn(reader_loop(
        reader,
        codec,
        recv_queue.clone(),
        pause_gate.clone(),
        heart_beats.hb_recv,
        cfg.max_network_delay,
    ));

    Ok(ClientConnection {
        send_queue,
        recv_queue,
        heart_beats,
        pause_gate,
        writer_task,
        reader_task,
    })
}

async fn read_connected<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &mut FrameCodec,
    cfg: &ClientConfig,
) -> Result<HeartBeats, RelayError> {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = timeout(cfg.max_network_delay, reader.read(&mut buf))
            .await
            .map_err(|_| TimeoutError::Handshake(cfg.max_network_delay))??;
        if n == 0 {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            ))
            .into());
        }
        codec.feed(&buf[..n]);
        for frame in codec.drain_frames()? {
            match frame {
                Frame::Heartbeat => continue,
                Frame::Command {
                    command: Command::Connected,
                    headers,
                    ..
                } => {
                    let version = header_value(&headers, "version").ok_or(ProtocolError::MissingHeader("version"))?;
                    if version != "1.2" {
                        return Err(ProtocolError::UnsupportedVersion(version.to_owned()).into());
                    }
                    let (peer_sx, peer_sy) = parse_heart_beat(header_value(&headers, "heart-beat").unwrap_or("0,0"))?;
                    return Ok(HeartBeats {
                        hb_send: negotiate(cfg.hb_send_min, peer_sy),
                        hb_recv: negotiate(cfg.hb_recv_desired, peer_sx),
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
    send_queue: Arc<WatermarkQueue<WriteItem<Message>>>,
    destination: String,
    hb_send: u64,
) -> Result<(), RelayError> {
    let result = writer_loop_inner(writer, send_queue.clone(), destination, hb_send).await;
    send_queue.close();
    result
}

async fn writer_loop_inner(
    mut writer: WriteHalf<impl AsyncWrite>,
    send_queue: Arc<WatermarkQueue<WriteItem<Message>>>,
    destination: String,
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
            WriteItem::Item(message) => {
                let headers = vec![
                    ("destination".to_owned(), destination.clone()),
                    ("content-type".to_owned(), message.content_type.clone()),
                    ("receipt".to_owned(), message.id.clone()),
                ];
                let frame = Frame::new(Command::Send, headers, message.body);
                writer.write_all(&frame.encode()).await?;
            }
            WriteItem::Close => {
                let frame = Frame::new(Command::Disconnect, vec![("receipt".to_owned(), "close".to_owned())], Vec::new());
                writer.write_all(&frame.encode()).await?;
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
    recv_queue: Arc<WatermarkQueue<String>>,
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
    recv_queue: Arc<WatermarkQueue<String>>,
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
                    command: Command::Receipt,
                    headers,
                    ..
                } => {
                    let id = header_value(&headers, "receipt-id")
                        .ok_or(ProtocolError::MissingHeader("receipt-id"))?
                        .to_owned();
                    if let Some(Watermark::High) = recv_queue.put(id).await {
                        pause_gate.pause();
                    }
                }
                Frame::Command {
                    command: Command::Error,
                    headers,
                    body,
                } => {
                    let message = header_value(&headers, "message").unwrap_or_default().to_owned();
                    return Err(ServerError {
                        message,
                        receipt_id: None,
                        context: Some(body),
                        context_type: None,
                        context_content_type: None,
                    }
                    .into());
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

    async fn respond_connected(server: &mut (impl AsyncRead + AsyncWrite + Unpin), heart_beat: &str) {
        let mut buf = [0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"CONNECT\n"));
        let frame = Frame::new(
            Command::Connected,
            vec![
                ("version".to_owned(), "1.2".to_owned()),
                ("heart-beat".to_owned(), heart_beat.to_owned()),
            ],
            Vec::new(),
        );
        server.write_all(&frame.encode()).await.unwrap();
    }

    #[tokio::test]
    async fn connect_negotiates_heart_beats_from_seed_scenario_1() {
        let (client_io, mut server_io) = tokio::io::duplex(4096);
        let cfg = ClientConfig {
            host: "my".to_owned(),
            send_destination: "dest".to_owned(),
            hb_send_min: 1000,
            hb_recv_desired: 90,
            ..Default::default()
        };

        let server_task = tokio::spawn(async move {
            respond_connected(&mut server_io, "500,8000").await;
            server_io
        });

        let conn = connect(client_io, cfg).await.unwrap();
        assert_eq!(conn.heart_beats.hb_send, 8000);
        assert_eq!(conn.heart_beats.hb_recv, 500);

        drop(server_task);
    }

    #[tokio::test]
    async fn writer_emits_send_with_receipt_from_seed_scenario_2() {
        let (client_io, mut server_io) = tokio::io::duplex(4096);
        let cfg = ClientConfig {
            host: "my".to_owned(),
            send_destination: "dest".to_owned(),
            ..Default::default()
        };

        let server_task = tokio::spawn(async move {
            respond_connected(&mut server_io, "0,0").await;
            let mut buf = [0u8; 4096];
            let n = server_io.read(&mut buf).await.unwrap();
            (server_io, buf[..n].to_vec())
        });

        let conn = connect(client_io, cfg).await.unwrap();
        conn.send_queue
            .put(WriteItem::Item(Message {
                id: "m1".to_owned(),
                message_type: "x".to_owned(),
                content_type: "text/plain".to_owned(),
                body: b"1".to_vec(),
            }))
            .await;

        let (_server_io, sent) = server_task.await.unwrap();
        assert_eq!(
            sent,
            b"SEND\ndestination:dest\ncontent-type:text/plain\nreceipt:m1\ncontent-length:1\n\n1\x00"
        );
    }
}

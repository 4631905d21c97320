//! Shared test fixtures: a scripted VNC server and a stub encoder.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::encode::{EncodedPayload, VideoEncoder};
use crate::framebuffer::{Frame, Rect};
use crate::rfb::{auth, wire};
use crate::{BridgeError, Result};

/// Route `tracing` output through the test harness, filtered by `RUST_LOG`.
///
/// First caller installs the subscriber; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server-to-client actions a test can script.
#[derive(Debug, Clone)]
pub enum ServerUpdate {
    /// One Raw-encoded rectangle, pixels given as RGBA.
    Raw { rect: Rect, rgba: Vec<u8> },
    CopyRect { src_x: u16, src_y: u16, rect: Rect },
    Rre { rect: Rect, bg: [u8; 4], subrects: Vec<(Rect, [u8; 4])> },
    DesktopSize { width: u16, height: u16 },
    /// Drop the TCP connection.
    Close,
}

/// Client-to-server messages, parsed for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    SetPixelFormat(wire::PixelFormat),
    SetEncodings(Vec<i32>),
    UpdateRequest { incremental: bool },
    Key { keysym: u32, down: bool },
    Pointer { x: u16, y: u16, buttons: u8 },
}

/// A single-connection VNC server driven by a script of [`ServerUpdate`]s.
pub struct FakeVncServer {
    addr: SocketAddr,
    pub updates: mpsc::Sender<ServerUpdate>,
    pub client_msgs: mpsc::Receiver<ClientMessage>,
    task: JoinHandle<()>,
}

impl FakeVncServer {
    /// Bind on an ephemeral port and serve one client.
    pub async fn start(width: u16, height: u16, password: Option<&str>) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let password = password.map(str::to_owned);

        let (updates_tx, updates_rx) = mpsc::channel(16);
        let (msgs_tx, msgs_rx) = mpsc::channel(64);

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = serve(stream, width, height, password, updates_rx, msgs_tx).await;
        });

        Self { addr, updates: updates_tx, client_msgs: msgs_rx, task }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Next client message that is not a routine update request.
    pub async fn next_non_request(&mut self) -> Option<ClientMessage> {
        while let Some(msg) = self.client_msgs.recv().await {
            if !matches!(msg, ClientMessage::UpdateRequest { .. }) {
                return Some(msg);
            }
        }
        None
    }

    pub fn abort(self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    width: u16,
    height: u16,
    password: Option<String>,
    mut updates: mpsc::Receiver<ServerUpdate>,
    msgs: mpsc::Sender<ClientMessage>,
) -> Result<()> {
    let io = |e: std::io::Error| BridgeError::connection_with_source("fake server io", Box::new(e));

    // Version exchange
    stream.write_all(wire::PROTOCOL_VERSION).await.map_err(io)?;
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await.map_err(io)?;

    // Security
    let security = if password.is_some() { wire::SECURITY_VNC_AUTH } else { wire::SECURITY_NONE };
    stream.write_all(&[1, security]).await.map_err(io)?;
    let mut chosen = [0u8; 1];
    stream.read_exact(&mut chosen).await.map_err(io)?;
    if let Some(password) = &password {
        let challenge = [7u8; 16];
        stream.write_all(&challenge).await.map_err(io)?;
        let mut response = [0u8; 16];
        stream.read_exact(&mut response).await.map_err(io)?;
        if response == auth::encrypt_challenge(&challenge, password) {
            stream.write_all(&0u32.to_be_bytes()).await.map_err(io)?;
        } else {
            stream.write_all(&1u32.to_be_bytes()).await.map_err(io)?;
            let reason = b"wrong password";
            stream.write_all(&(reason.len() as u32).to_be_bytes()).await.map_err(io)?;
            stream.write_all(reason).await.map_err(io)?;
            return Ok(());
        }
    } else {
        stream.write_all(&0u32.to_be_bytes()).await.map_err(io)?;
    }

    // ClientInit, ServerInit
    let mut shared = [0u8; 1];
    stream.read_exact(&mut shared).await.map_err(io)?;
    let mut server_init = Vec::new();
    server_init.extend_from_slice(&width.to_be_bytes());
    server_init.extend_from_slice(&height.to_be_bytes());
    server_init.extend_from_slice(&wire::PixelFormat::rgba().to_bytes());
    let name = b"fake desktop";
    server_init.extend_from_slice(&(name.len() as u32).to_be_bytes());
    server_init.extend_from_slice(name);
    stream.write_all(&server_init).await.map_err(io)?;

    let (mut reader, mut writer) = stream.into_split();

    // Reader runs independently so a scripted update can never interleave
    // with a half-read client message
    tokio::spawn(async move {
        loop {
            match read_client_message(&mut reader).await {
                Ok(Some(msg)) => {
                    if msgs.send(msg).await.is_err() {
                        return;
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    });

    while let Some(update) = updates.recv().await {
        if matches!(update, ServerUpdate::Close) {
            return Ok(());
        }
        writer.write_all(&encode_update(&update)).await.map_err(io)?;
    }
    Ok(())
}

async fn read_client_message(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
) -> Result<Option<ClientMessage>> {
    let mut tag = [0u8; 1];
    if reader.read_exact(&mut tag).await.is_err() {
        return Ok(None);
    }
    let msg = match tag[0] {
        wire::MSG_SET_PIXEL_FORMAT => {
            let mut body = [0u8; 19];
            reader.read_exact(&mut body).await?;
            let mut pf = [0u8; 16];
            pf.copy_from_slice(&body[3..]);
            ClientMessage::SetPixelFormat(wire::PixelFormat::from_bytes(&pf))
        }
        wire::MSG_SET_ENCODINGS => {
            let mut head = [0u8; 3];
            reader.read_exact(&mut head).await?;
            let count = u16::from_be_bytes([head[1], head[2]]) as usize;
            let mut body = vec![0u8; count * 4];
            reader.read_exact(&mut body).await?;
            ClientMessage::SetEncodings(
                body.chunks_exact(4)
                    .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )
        }
        wire::MSG_FRAMEBUFFER_UPDATE_REQUEST => {
            let mut body = [0u8; 9];
            reader.read_exact(&mut body).await?;
            ClientMessage::UpdateRequest { incremental: body[0] != 0 }
        }
        wire::MSG_KEY_EVENT => {
            let mut body = [0u8; 7];
            reader.read_exact(&mut body).await?;
            ClientMessage::Key {
                keysym: u32::from_be_bytes([body[3], body[4], body[5], body[6]]),
                down: body[0] != 0,
            }
        }
        wire::MSG_POINTER_EVENT => {
            let mut body = [0u8; 5];
            reader.read_exact(&mut body).await?;
            ClientMessage::Pointer {
                x: u16::from_be_bytes([body[1], body[2]]),
                y: u16::from_be_bytes([body[3], body[4]]),
                buttons: body[0],
            }
        }
        other => return Err(BridgeError::protocol(format!("fake server got {other}"))),
    };
    Ok(Some(msg))
}

/// Wire pixel in the canonical format the client negotiates.
fn wire_pixel(rgba: &[u8]) -> [u8; 4] {
    [rgba[0], rgba[1], rgba[2], 0]
}

fn rect_header(rect: Rect, encoding: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&rect.x.to_be_bytes());
    out.extend_from_slice(&rect.y.to_be_bytes());
    out.extend_from_slice(&rect.width.to_be_bytes());
    out.extend_from_slice(&rect.height.to_be_bytes());
    out.extend_from_slice(&encoding.to_be_bytes());
    out
}

fn encode_update(update: &ServerUpdate) -> Vec<u8> {
    let mut out = vec![wire::MSG_FRAMEBUFFER_UPDATE, 0, 0, 1];
    match update {
        ServerUpdate::Raw { rect, rgba } => {
            out.extend_from_slice(&rect_header(*rect, wire::ENCODING_RAW));
            for px in rgba.chunks_exact(4) {
                out.extend_from_slice(&wire_pixel(px));
            }
        }
        ServerUpdate::CopyRect { src_x, src_y, rect } => {
            out.extend_from_slice(&rect_header(*rect, wire::ENCODING_COPY_RECT));
            out.extend_from_slice(&src_x.to_be_bytes());
            out.extend_from_slice(&src_y.to_be_bytes());
        }
        ServerUpdate::Rre { rect, bg, subrects } => {
            out.extend_from_slice(&rect_header(*rect, wire::ENCODING_RRE));
            out.extend_from_slice(&(subrects.len() as u32).to_be_bytes());
            out.extend_from_slice(&wire_pixel(bg));
            for (sub, colour) in subrects {
                out.extend_from_slice(&wire_pixel(colour));
                out.extend_from_slice(&sub.x.to_be_bytes());
                out.extend_from_slice(&sub.y.to_be_bytes());
                out.extend_from_slice(&sub.width.to_be_bytes());
                out.extend_from_slice(&sub.height.to_be_bytes());
            }
        }
        ServerUpdate::DesktopSize { width, height } => {
            out.extend_from_slice(&rect_header(
                Rect::new(0, 0, *width, *height),
                wire::ENCODING_DESKTOP_SIZE,
            ));
        }
        ServerUpdate::Close => unreachable!("handled by the server loop"),
    }
    out
}

/// Records what it was asked to encode; payloads carry the frame's
/// dimensions and first pixel so tests can assert on content.
#[derive(Clone, Default)]
pub struct StubEncoder {
    pub encoded: Arc<Mutex<Vec<(u16, u16, bool)>>>,
    pub reconfigures: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl VideoEncoder for StubEncoder {
    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Option<EncodedPayload>> {
        self.encoded.lock().unwrap().push((frame.width, frame.height, force_keyframe));
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&frame.width.to_be_bytes());
        data.extend_from_slice(&frame.height.to_be_bytes());
        data.extend_from_slice(&frame.pixels[..4.min(frame.pixels.len())]);
        Ok(Some(EncodedPayload { data: Bytes::from(data), keyframe: force_keyframe }))
    }

    fn reconfigure(&mut self, width: u16, height: u16) -> Result<()> {
        self.reconfigures.lock().unwrap().push((width, height));
        Ok(())
    }
}

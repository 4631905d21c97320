//! RFB session client: handshake, decode loop, upstream input events.
//!
//! The session is a strictly forward state machine:
//!
//! ```text
//! Handshaking → Authenticating → PixelFormatNegotiation → Streaming → Closed
//! ```
//!
//! Any I/O or protocol error while `Streaming` moves to `Closed`; a fresh
//! [`RfbSession::connect`] is required afterwards. Reconnect policy belongs
//! to an external supervisor, not to this client.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::control::ControlEvent;
use crate::framebuffer::{BYTES_PER_PIXEL, PatchRect, Rect, SharedFramebuffer};
use crate::rfb::{auth, wire};
use crate::{BridgeError, Result};

/// Handshake/streaming phase of one session instance.
///
/// Transitions are strictly forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Handshaking,
    Authenticating,
    PixelFormatNegotiation,
    Streaming,
    Closed,
}

/// Clonable handle for client-to-server messages.
///
/// The decode loop owns the read half; this wraps the write half so update
/// requests and viewer input events can be sent from separate tasks.
#[derive(Debug, Clone)]
pub struct RfbSender {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
}

impl RfbSender {
    fn new(writer: OwnedWriteHalf) -> Self {
        Self { writer: Arc::new(tokio::sync::Mutex::new(writer)) }
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.map_err(|_| BridgeError::Disconnected)?;
        writer.flush().await.map_err(|_| BridgeError::Disconnected)?;
        Ok(())
    }

    /// Request a framebuffer update for the full screen.
    pub async fn request_update(&self, incremental: bool, width: u16, height: u16) -> Result<()> {
        self.send(&wire::framebuffer_update_request(incremental, 0, 0, width, height)).await
    }

    /// Forward one viewer input event upstream, coordinates unmodified.
    pub async fn send_control_event(&self, event: &ControlEvent) -> Result<()> {
        match *event {
            ControlEvent::Pointer { x, y, buttons } => {
                self.send(&wire::pointer_event(buttons, x, y)).await
            }
            ControlEvent::Key { keysym, down } => self.send(&wire::key_event(down, keysym)).await,
        }
    }
}

/// A connected, handshake-complete VNC client session.
#[derive(Debug)]
pub struct RfbSession {
    reader: BufReader<OwnedReadHalf>,
    sender: RfbSender,
    phase: SessionPhase,
    format: wire::PixelFormat,
    width: u16,
    height: u16,
    name: String,
    read_timeout: Duration,
}

impl RfbSession {
    /// Connect to a VNC server and run the handshake to completion.
    ///
    /// Connection refusal and credential rejection surface as the distinct
    /// [`BridgeError::Connection`] and [`BridgeError::Auth`] kinds.
    pub async fn connect(
        addr: &str,
        password: Option<&str>,
        read_timeout: Duration,
    ) -> Result<Self> {
        info!(addr, "connecting to VNC server");
        let stream = timeout(read_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BridgeError::timeout(read_timeout))?
            .map_err(|e| {
                BridgeError::connection_with_source(
                    format!("could not reach {addr}"),
                    Box::new(e),
                )
            })?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, password, read_timeout).await
    }

    /// Run the RFB handshake on an already-established stream.
    pub async fn handshake(
        stream: TcpStream,
        password: Option<&str>,
        read_timeout: Duration,
    ) -> Result<Self> {
        let (read_half, write_half) = stream.into_split();
        let mut session = Self {
            reader: BufReader::new(read_half),
            sender: RfbSender::new(write_half),
            phase: SessionPhase::Handshaking,
            format: wire::PixelFormat::rgba(),
            width: 0,
            height: 0,
            name: String::new(),
            read_timeout,
        };

        session.negotiate_version().await?;
        session.phase = SessionPhase::Authenticating;
        session.authenticate(password).await?;
        session.phase = SessionPhase::PixelFormatNegotiation;
        session.negotiate_format().await?;
        session.phase = SessionPhase::Streaming;

        info!(
            name = %session.name,
            width = session.width,
            height = session.height,
            "VNC session streaming"
        );
        Ok(session)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Desktop name reported by ServerInit.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for update requests and viewer input from other tasks.
    pub fn sender(&self) -> RfbSender {
        self.sender.clone()
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match timeout(self.read_timeout, self.reader.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::connection_with_source(
                "VNC server closed the connection",
                Box::new(e),
            )),
            Err(_) => Err(BridgeError::timeout(self.read_timeout)),
        }
    }

    async fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    async fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    async fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Read the reason string servers attach to handshake failures.
    async fn read_reason(&mut self) -> Result<String> {
        let len = self.read_u32().await? as usize;
        if len > 4096 {
            return Err(BridgeError::protocol(format!("unreasonable reason length {len}")));
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn negotiate_version(&mut self) -> Result<()> {
        let mut version = [0u8; 12];
        self.read_exact(&mut version).await?;
        if &version[..4] != b"RFB " {
            return Err(BridgeError::protocol("server did not speak RFB"));
        }
        debug!(server_version = %String::from_utf8_lossy(&version).trim(), "version exchange");
        self.sender.send(wire::PROTOCOL_VERSION).await?;
        Ok(())
    }

    async fn authenticate(&mut self, password: Option<&str>) -> Result<()> {
        let num_types = self.read_u8().await?;
        if num_types == 0 {
            let reason = self.read_reason().await?;
            return Err(BridgeError::connection(format!("server refused handshake: {reason}")));
        }

        let mut types = vec![0u8; num_types as usize];
        self.read_exact(&mut types).await?;
        debug!(?types, "security types offered");

        let chosen = if password.is_none() && types.contains(&wire::SECURITY_NONE) {
            wire::SECURITY_NONE
        } else if types.contains(&wire::SECURITY_VNC_AUTH) {
            wire::SECURITY_VNC_AUTH
        } else if types.contains(&wire::SECURITY_NONE) {
            wire::SECURITY_NONE
        } else {
            return Err(BridgeError::protocol(format!(
                "no mutually supported security type in {types:?}"
            )));
        };
        self.sender.send(&[chosen]).await?;

        if chosen == wire::SECURITY_VNC_AUTH {
            let password = password
                .ok_or_else(|| BridgeError::auth("server requires a password, none provided"))?;
            let mut challenge = [0u8; 16];
            self.read_exact(&mut challenge).await?;
            self.sender.send(&auth::encrypt_challenge(&challenge, password)).await?;
        }

        let result = self.read_u32().await?;
        if result != 0 {
            // RFB 3.8 attaches a reason string to the failure result
            let reason =
                self.read_reason().await.unwrap_or_else(|_| "authentication failed".to_string());
            return Err(BridgeError::auth(reason));
        }
        Ok(())
    }

    async fn negotiate_format(&mut self) -> Result<()> {
        // ClientInit: shared flag set so we do not kick other viewers
        self.sender.send(&[1]).await?;

        self.width = self.read_u16().await?;
        self.height = self.read_u16().await?;
        let mut pf = [0u8; 16];
        self.read_exact(&mut pf).await?;
        let server_format = wire::PixelFormat::from_bytes(&pf);
        let name_len = self.read_u32().await? as usize;
        if name_len > 4096 {
            return Err(BridgeError::protocol(format!("unreasonable name length {name_len}")));
        }
        let mut name = vec![0u8; name_len];
        self.read_exact(&mut name).await?;
        self.name = String::from_utf8_lossy(&name).into_owned();

        trace!(?server_format, "server pixel format (replaced by SetPixelFormat)");

        // Force the canonical 32-bit layout so every decoded rectangle lands
        // in the framebuffer's RGBA format.
        self.format = wire::PixelFormat::rgba();
        self.sender.send(&wire::set_pixel_format(&self.format)).await?;
        self.sender.send(&wire::set_encodings(wire::SUPPORTED_ENCODINGS)).await?;
        Ok(())
    }

    /// Decode server messages and apply update rectangles until the session
    /// ends.
    ///
    /// Patches apply to `framebuffer` in wire order. Returns `Ok(())` only on
    /// cancellation; every other exit is the fatal error that closed the
    /// session. Not restartable: a new [`RfbSession::connect`] is required.
    pub async fn run(
        mut self,
        framebuffer: SharedFramebuffer,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug_assert_eq!(self.phase, SessionPhase::Streaming);

        // Prime the stream with one full-frame request
        self.sender.request_update(false, self.width, self.height).await?;

        let result = self.stream_loop(&framebuffer, &cancel).await;
        self.phase = SessionPhase::Closed;
        match &result {
            Ok(()) => info!("VNC session closed"),
            Err(e) => warn!(error = %e, "VNC session terminated"),
        }
        result
    }

    async fn stream_loop(
        &mut self,
        framebuffer: &SharedFramebuffer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            // Idle wait for the next message tag. A quiet server is normal
            // (incremental requests only get answers when pixels change), so
            // expiry here re-issues the request instead of tearing down;
            // deadlines inside a message body stay fatal.
            let msg_type = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RFB loop cancelled");
                    return Ok(());
                }
                tag = self.read_u8() => match tag {
                    Ok(tag) => tag,
                    Err(BridgeError::Timeout { .. }) => {
                        trace!("no server message within deadline, re-requesting");
                        self.sender.request_update(true, self.width, self.height).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            match msg_type {
                wire::MSG_FRAMEBUFFER_UPDATE => {
                    self.handle_update(framebuffer).await?;
                    self.sender.request_update(true, self.width, self.height).await?;
                }
                wire::MSG_BELL => {
                    trace!("bell");
                }
                wire::MSG_SERVER_CUT_TEXT => {
                    self.discard_cut_text().await?;
                }
                wire::MSG_SET_COLOUR_MAP => {
                    // We negotiated true colour; a colour map violates that.
                    return Err(BridgeError::protocol(
                        "server sent SetColourMapEntries after true-colour negotiation",
                    ));
                }
                other => {
                    return Err(BridgeError::protocol(format!(
                        "unknown server message type {other}"
                    )));
                }
            }
        }
    }

    async fn handle_update(&mut self, framebuffer: &SharedFramebuffer) -> Result<()> {
        let _padding = self.read_u8().await?;
        let num_rects = self.read_u16().await?;
        trace!(num_rects, "framebuffer update");

        for _ in 0..num_rects {
            let mut header_bytes = [0u8; 12];
            self.read_exact(&mut header_bytes).await?;
            let header = wire::RectHeader::from_bytes(&header_bytes);

            match header.encoding {
                wire::ENCODING_RAW => {
                    self.check_rect_bounds(&header)?;
                    let patch = self.read_raw_rect(&header).await?;
                    framebuffer.apply_patch(&patch)?;
                }
                wire::ENCODING_COPY_RECT => {
                    self.check_rect_bounds(&header)?;
                    let src_x = self.read_u16().await?;
                    let src_y = self.read_u16().await?;
                    framebuffer.copy_rect(
                        src_x,
                        src_y,
                        Rect::new(header.x, header.y, header.width, header.height),
                    )?;
                }
                wire::ENCODING_RRE => {
                    self.check_rect_bounds(&header)?;
                    let patch = self.read_rre_rect(&header).await?;
                    framebuffer.apply_patch(&patch)?;
                }
                wire::ENCODING_DESKTOP_SIZE => {
                    // Structural event, not a pixel patch
                    info!(
                        width = header.width,
                        height = header.height,
                        "desktop size changed"
                    );
                    self.width = header.width;
                    self.height = header.height;
                    framebuffer.resize(header.width, header.height);
                }
                other => {
                    // Pixel semantics would be undefined; never retried
                    return Err(BridgeError::protocol(format!(
                        "server used unsupported encoding {other}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reject a rectangle that falls outside the current desktop.
    ///
    /// Runs on the 12-byte header alone, before any payload-sized buffer is
    /// allocated: width and height come straight off the wire and must never
    /// size an allocation unchecked.
    fn check_rect_bounds(&self, header: &wire::RectHeader) -> Result<()> {
        let x_end = u32::from(header.x) + u32::from(header.width);
        let y_end = u32::from(header.y) + u32::from(header.height);
        if x_end > u32::from(self.width) || y_end > u32::from(self.height) {
            return Err(BridgeError::protocol(format!(
                "rectangle {}x{} at ({}, {}) exceeds the {}x{} desktop",
                header.width, header.height, header.x, header.y, self.width, self.height
            )));
        }
        Ok(())
    }

    async fn read_raw_rect(&mut self, header: &wire::RectHeader) -> Result<PatchRect> {
        let count = header.width as usize * header.height as usize;
        let mut raw = vec![0u8; count * self.format.bytes_per_pixel()];
        self.read_exact(&mut raw).await?;
        let rgba = self.format.decode_pixels(&raw, count)?;
        Ok(PatchRect::new(Rect::new(header.x, header.y, header.width, header.height), rgba))
    }

    /// Read one pixel in the negotiated format and decode it to RGBA.
    async fn read_pixel(&mut self) -> Result<[u8; 4]> {
        let mut raw = vec![0u8; self.format.bytes_per_pixel()];
        self.read_exact(&mut raw).await?;
        let decoded = self.format.decode_pixels(&raw, 1)?;
        // decode_pixels yields exactly four bytes per pixel
        let mut rgba = [0u8; 4];
        rgba.copy_from_slice(&decoded);
        Ok(rgba)
    }

    async fn read_rre_rect(&mut self, header: &wire::RectHeader) -> Result<PatchRect> {
        let num_subrects = self.read_u32().await? as usize;
        let bg_rgba = self.read_pixel().await?;

        let rect = Rect::new(header.x, header.y, header.width, header.height);
        let mut patch = PatchRect::solid(rect, bg_rgba);

        let width = header.width as usize;
        for _ in 0..num_subrects {
            let rgba = self.read_pixel().await?;

            let sx = self.read_u16().await? as usize;
            let sy = self.read_u16().await? as usize;
            let sw = self.read_u16().await? as usize;
            let sh = self.read_u16().await? as usize;
            if sx + sw > width || sy + sh > header.height as usize {
                return Err(BridgeError::protocol("RRE subrectangle exceeds its rectangle"));
            }

            for row in sy..sy + sh {
                for col in sx..sx + sw {
                    let at = (row * width + col) * BYTES_PER_PIXEL;
                    patch.pixels[at..at + 4].copy_from_slice(&rgba);
                }
            }
        }
        Ok(patch)
    }

    async fn discard_cut_text(&mut self) -> Result<()> {
        let mut padding = [0u8; 3];
        self.read_exact(&mut padding).await?;
        let len = self.read_u32().await? as usize;
        let mut discard = vec![0u8; len.min(1 << 20)];
        self.read_exact(&mut discard).await?;
        if len > discard.len() {
            return Err(BridgeError::protocol("oversized ServerCutText"));
        }
        trace!(len, "discarded server cut text");
        Ok(())
    }
}

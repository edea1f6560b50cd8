use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PROTOCOL_V1: u8 = 1;

pub const MAX_FRAME_JSON_BYTES: u32 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version")]
    BadVersion,
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("rejected by broker: {0}")]
    Rejected(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame kinds carried on the control stream (and the ready marker carried on
/// data streams).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Auth,
    Register,
    Reply,
    Ready,
}

impl Frame {
    fn magic(self) -> &'static [u8; 4] {
        match self {
            Frame::Auth => b"RTAU",
            Frame::Register => b"RTRG",
            Frame::Reply => b"RTOK",
            Frame::Ready => b"RTRD",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub binding: TunnelBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
}

/// What the broker should expose for one tunnel. The worker never looks
/// inside; it is handed to registration as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelBinding {
    pub name: String,
    #[serde(default)]
    pub protocol: String, // tcp | http
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl TunnelBinding {
    pub fn normalize(mut self) -> Option<Self> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return None;
        }
        self.protocol = self.protocol.trim().to_ascii_lowercase();
        if self.protocol.is_empty() {
            self.protocol = "tcp".into();
        }
        self.subdomain = non_empty_lower(self.subdomain.take());
        self.hostname = non_empty_lower(self.hostname.take());
        Some(self)
    }
}

fn non_empty_lower(v: Option<String>) -> Option<String> {
    let v = v?;
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    Some(v.to_ascii_lowercase())
}

pub async fn write_frame<W, T>(w: &mut W, frame: Frame, payload: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    w.write_all(frame.magic()).await?;
    w.write_u8(PROTOCOL_V1).await?;

    let b = serde_json::to_vec(payload)?;
    let n: u32 = b
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if n > MAX_FRAME_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(r: &mut R, frame: Frame) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    read_header(r, frame).await?;

    let n = r.read_u32().await?;
    if n > MAX_FRAME_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

async fn read_header<R: AsyncRead + Unpin>(r: &mut R, frame: Frame) -> Result<(), ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != frame.magic() {
        return Err(ProtocolError::BadMagic);
    }

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion);
    }
    Ok(())
}

pub async fn write_auth_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    token: &str,
) -> Result<(), ProtocolError> {
    let req = AuthRequest {
        token: token.to_string(),
    };
    write_frame(w, Frame::Auth, &req).await
}

pub async fn write_register_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    binding: &TunnelBinding,
) -> Result<(), ProtocolError> {
    let req = RegisterRequest {
        binding: binding.clone(),
    };
    write_frame(w, Frame::Register, &req).await
}

/// Read a broker reply, turning `ok: false` into `ProtocolError::Rejected`.
pub async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    let reply: Reply = read_frame(r, Frame::Reply).await?;
    if !reply.ok {
        return Err(ProtocolError::Rejected(reply.message));
    }
    Ok(reply.message)
}

pub async fn write_ready<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), ProtocolError> {
    w.write_all(Frame::Ready.magic()).await?;
    w.write_u8(PROTOCOL_V1).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_ready<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), ProtocolError> {
    read_header(r, Frame::Ready).await
}

//! Wire protocol spoken with server-mode probe processes.
//!
//! Both directions carry length-prefixed protobuf messages over the
//! process's stdin/stdout:
//!
//! ```text
//! Content-Length: <decimal byte count>\n
//! \n
//! <payload bytes>
//! ```
//!
//! Requests go to the process, replies come back; correlation is by
//! `request_id`.

use prost::Message;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One name/value option forwarded to the probe process.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestOption {
    /// Option name
    #[prost(string, tag = "1")]
    pub name: String,
    /// Option value, after label substitution
    #[prost(string, tag = "2")]
    pub value: String,
}

/// A probe request for one target.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProbeRequest {
    /// Correlation id, unique per engine instance
    #[prost(int32, tag = "1")]
    pub request_id: i32,
    /// How long the process may spend on this request, in milliseconds
    #[prost(int32, tag = "2")]
    pub time_limit_msec: i32,
    /// Probe options, e.g. the substituted target address
    #[prost(message, repeated, tag = "3")]
    pub options: Vec<RequestOption>,
}

/// The probe process's answer to one request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProbeReply {
    /// Correlation id copied from the request
    #[prost(int32, tag = "1")]
    pub request_id: i32,
    /// Probe output; parsed into metrics when output-as-metrics is on
    #[prost(string, tag = "2")]
    pub payload: String,
    /// Non-empty when the probe failed
    #[prost(string, tag = "3")]
    pub error_message: String,
}

/// Errors reading or writing protocol frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The pipe failed or closed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The header line was not `Content-Length: <n>`
    #[error("malformed frame header {0:?}")]
    BadHeader(String),
    /// The payload bytes did not decode as the expected message
    #[error("undecodable frame payload: {0}")]
    BadPayload(#[from] prost::DecodeError),
}

/// Write one framed message.
pub async fn write_message<M: Message, W: AsyncWrite + Unpin>(
    msg: &M,
    w: &mut W,
) -> Result<(), FrameError> {
    let body = msg.encode_to_vec();
    w.write_all(format!("Content-Length: {}\n\n", body.len()).as_bytes())
        .await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one framed [`ProbeReply`]. An empty read at a frame boundary means
/// the peer closed the pipe and surfaces as `UnexpectedEof`.
pub async fn read_reply<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<ProbeReply, FrameError> {
    read_message(r).await
}

/// Read one framed message of any protocol type.
pub async fn read_message<M: Message + Default, R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<M, FrameError> {
    let header = read_line(r).await?;
    let len: usize = header
        .strip_prefix("Content-Length:")
        .map(str::trim)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| FrameError::BadHeader(header.clone()))?;

    let blank = read_line(r).await?;
    if !blank.is_empty() {
        return Err(FrameError::BadHeader(blank));
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(M::decode(body.as_slice())?)
}

async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<String, FrameError> {
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "probe process pipe closed",
        )));
    }
    Ok(line.trim_end_matches('\n').to_string())
}

//! WebSocket wire layer.
//!
//! The only module that names `tokio-tungstenite` types. [`connect`] opens a
//! socket and splits it into a [`FrameSink`] and a [`FrameSource`], which
//! [`crate::transport`] drives from its pump task. [`endpoint_url`] turns a
//! loose server address into something `connect` accepts.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Close code used when the peer's close frame carries no status.
const NO_STATUS_CODE: u16 = 1005;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A frame the pump has to act on. Pongs and raw frames never surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text, or a binary frame that holds valid UTF-8.
    Text(String),
    /// Ping that needs a pong with the same payload.
    Ping(Vec<u8>),
    /// The peer sent a close frame.
    Closed {
        /// Close code (1005 when the peer gave none).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Sending half of a socket.
#[derive(Debug)]
pub struct FrameSink {
    inner: SplitSink<Socket, Message>,
}

impl FrameSink {
    /// Send a text frame.
    pub async fn text(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::text(text))
            .await
            .context("WebSocket text send failed")
    }

    /// Answer a ping.
    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.inner
            .send(Message::Pong(payload.into()))
            .await
            .context("WebSocket pong failed")
    }

    /// Send a close frame and flush the sink.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .send(Message::Close(None))
            .await
            .context("WebSocket close frame failed")?;
        self.inner.close().await.context("WebSocket sink close failed")
    }
}

/// Receiving half of a socket.
#[derive(Debug)]
pub struct FrameSource {
    inner: SplitStream<Socket>,
}

impl FrameSource {
    /// Next frame worth acting on, or `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> Option<Result<Frame>> {
        while let Some(message) = self.inner.next().await {
            let frame = match message {
                Ok(Message::Text(text)) => Frame::Text(text.to_string()),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(_) => {
                        log::debug!("[Transport] Skipping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Ping(payload)) => Frame::Ping(payload.to_vec()),
                Ok(Message::Close(close)) => match close {
                    Some(close) => Frame::Closed {
                        code: u16::from(close.code),
                        reason: close.reason.to_string(),
                    },
                    None => Frame::Closed {
                        code: NO_STATUS_CODE,
                        reason: String::new(),
                    },
                },
                Ok(Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => return Some(Err(anyhow::Error::new(e).context("WebSocket read failed"))),
            };
            return Some(Ok(frame));
        }
        None
    }
}

/// Open a WebSocket to `url`, adding `headers` to the upgrade request.
///
/// # Errors
///
/// Fails on a malformed URL or header, or when the handshake does not
/// complete.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(FrameSink, FrameSource)> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;
    for (name, value) in headers {
        let name = HeaderName::try_from(*name).with_context(|| format!("bad header name {name}"))?;
        let value =
            HeaderValue::try_from(*value).with_context(|| format!("bad value for header {name}"))?;
        request.headers_mut().append(name, value);
    }

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket connect failed: {url}"))?;
    let (sink, source) = socket.split();
    Ok((FrameSink { inner: sink }, FrameSource { inner: source }))
}

/// Derive the WebSocket endpoint for a caller-supplied server address.
///
/// `ws://` and `wss://` pass through unchanged, `http(s)://` is mapped to the
/// matching WebSocket scheme, and a bare `host[:port]/path` gets
/// `default_scheme://` prepended.
#[must_use]
pub fn endpoint_url(uri: &str, default_scheme: &str) -> String {
    if uri.starts_with("wss://") || uri.starts_with("ws://") {
        uri.to_string()
    } else if let Some(rest) = uri.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = uri.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("{default_scheme}://{uri}")
    }
}

//! Session-facing transport: one WebSocket connection behind two queues.
//!
//! A background pump task owns the [`FrameSink`]/[`FrameSource`] pair and bridges
//! them to in-process channels, so a [`ChannelSession`](crate::ChannelSession)
//! never awaits the socket directly:
//!
//! ```text
//!   ChannelSession                 pump task                  server
//!        │  TransportSender ──────►  select! ──── text ──────►  │
//!        │                           │                          │
//!        │  ◄──── TransportEvent ──  next_frame ◄── frames ───── │
//! ```
//!
//! Ping frames are answered inside the pump. The pump exits when the socket
//! closes, when a close is requested, or when every sender is dropped.

// Rust guideline compliant 2026-02

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::PUMP_SHUTDOWN_GRACE;
use crate::ws::{self, Frame, FrameSink, FrameSource};

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Close code reported for a close this side asked for.
const NORMAL_CLOSE_CODE: u16 = 1000;

/// Outgoing command for the pump task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    /// Send a UTF-8 text frame.
    Text(String),
    /// Initiate a graceful close.
    Close,
}

/// Something the pump observed on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound text payload.
    Text(String),
    /// The connection was closed, by either side.
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// A transport-level failure; the connection is gone.
    Error(String),
}

/// Cloneable handle for queueing frames onto a transport.
#[derive(Clone, Debug)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl TransportSender {
    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Fails when the pump task has exited and the frame can never be sent.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_| anyhow::anyhow!("transport is closed"))
    }

    /// Ask the pump to close the socket. No-op if it is already gone.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    /// Whether the pump task has stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The half of a transport handed to a session: a sender and the inbound queue.
#[derive(Debug)]
pub struct TransportLink {
    pub(crate) sender: TransportSender,
    pub(crate) incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// Build a link from raw queues.
    ///
    /// Useful for driving a session over something other than a WebSocket;
    /// the returned receiver yields the text the session wants sent, and the
    /// returned sender feeds it inbound events.
    #[must_use]
    pub fn in_memory() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let close_tx = in_tx.clone();
        tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                match cmd {
                    Outgoing::Text(text) => {
                        if text_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = close_tx.send(TransportEvent::Closed {
                            code: NORMAL_CLOSE_CODE,
                            reason: String::new(),
                        });
                        break;
                    }
                }
            }
        });

        let link = Self {
            sender: TransportSender { tx: out_tx },
            incoming: in_rx,
        };
        (link, text_rx, in_tx)
    }
}

/// An open WebSocket connection with its pump task.
#[derive(Debug)]
pub struct Transport {
    endpoint: String,
    sender: TransportSender,
    incoming: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pump: Option<JoinHandle<()>>,
}

impl Transport {
    /// Connect to `endpoint`, sending `headers` with the upgrade request, and
    /// start the pump.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL or a header is invalid or the WebSocket
    /// handshake fails.
    pub async fn connect(endpoint: &str, headers: &[(&str, &str)]) -> Result<Self> {
        let (sink, source) = ws::connect(endpoint, headers).await?;
        log::info!("[Transport] WebSocket connected: {}", endpoint);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(run_pump(
            endpoint.to_string(),
            sink,
            source,
            out_rx,
            in_tx,
        ));

        Ok(Self {
            endpoint: endpoint.to_string(),
            sender: TransportSender { tx: out_tx },
            incoming: Some(in_rx),
            pump: Some(pump),
        })
    }

    /// The URL this transport is connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Hand the session its link. Only the first call returns `Some`.
    pub fn attach(&mut self) -> Option<TransportLink> {
        let incoming = self.incoming.take()?;
        Some(TransportLink {
            sender: self.sender.clone(),
            incoming,
        })
    }

    /// Whether the socket is still up.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Close the socket. Safe to call repeatedly or after the remote closed.
    pub fn disconnect(&mut self) {
        if self.is_open() {
            self.sender.close();
            log::info!("[Transport] WebSocket disconnected: {}", self.endpoint);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.sender.close();
        let Some(mut pump) = self.pump.take() else {
            return;
        };
        // Let the pump flush its close frame, but never leave it running.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if tokio::time::timeout(PUMP_SHUTDOWN_GRACE, &mut pump).await.is_err() {
                        pump.abort();
                    }
                });
            }
            Err(_) => pump.abort(),
        }
    }
}

/// Bridge the socket and the queues until either side goes away.
async fn run_pump(
    endpoint: String,
    mut sink: FrameSink,
    mut source: FrameSource,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        tokio::select! {
            frame = source.next_frame() => {
                match frame {
                    Some(Ok(Frame::Text(text))) => {
                        // Receiver not attached yet keeps the frame queued;
                        // receiver dropped means nobody will ever read it.
                        if incoming.send(TransportEvent::Text(text)).is_err() {
                            log::debug!("[Transport] Inbound queue dropped, closing {}", endpoint);
                            let _ = sink.shutdown().await;
                            break;
                        }
                    }
                    Some(Ok(Frame::Ping(payload))) => {
                        let _ = sink.pong(payload).await;
                    }
                    Some(Ok(Frame::Closed { code, reason })) => {
                        log::info!("[Transport] WebSocket closed by server: {} ({})", endpoint, code);
                        let _ = incoming.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("[Transport] WebSocket error: {:#}", e);
                        let _ = incoming.send(TransportEvent::Error(format!("{e:#}")));
                        break;
                    }
                    None => {
                        log::info!("[Transport] WebSocket stream ended: {}", endpoint);
                        let _ = incoming.send(TransportEvent::Closed {
                            code: ABNORMAL_CLOSE_CODE,
                            reason: "stream ended".to_string(),
                        });
                        break;
                    }
                }
            }

            cmd = outgoing.recv() => {
                match cmd {
                    Some(Outgoing::Text(text)) => {
                        let len = text.len();
                        if let Err(e) = sink.text(text).await {
                            log::error!("[Transport] Send failed: {:#}", e);
                            let _ = incoming.send(TransportEvent::Error(format!("{e:#}")));
                            break;
                        }
                        log::trace!("[Transport] Sent {} bytes", len);
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = sink.shutdown().await;
                        let _ = incoming.send(TransportEvent::Closed {
                            code: NORMAL_CLOSE_CODE,
                            reason: String::new(),
                        });
                        break;
                    }
                }
            }
        }
    }
}

//! Transport abstraction.
//!
//! A [`Connector`] opens one connection and hands back a [`FrameChannel`]:
//! frames written to `tx` go to the gateway, frames from the gateway arrive
//! on `rx`. Dropping either end closes the connection; `rx` yielding `None`
//! means the connection is gone.

use std::time::Duration;

use claw_proto::Frame;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// Default capacity of each direction of a [`FrameChannel`].
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// How long the writer waits for the peer to take a close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Both directions of one open connection.
#[derive(Debug)]
pub struct FrameChannel {
    /// Outbound frames.
    pub tx: mpsc::Sender<Frame>,
    /// Inbound frames.
    pub rx: mpsc::Receiver<Frame>,
}

/// Opens connections to a gateway.
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection.
    fn connect(&self) -> BoxFuture<'_, ClientResult<FrameChannel>>;
}

/// JSON frames over a WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    capacity: usize,
}

impl WsConnector {
    /// Create a connector for `url` (`ws://` or `wss://`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the per-direction channel capacity.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Gateway URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, ClientResult<FrameChannel>> {
        Box::pin(async move {
            let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
            debug!(url = %self.url, "websocket connected");
            let (mut write, mut read) = ws.split();

            let (out_tx, mut out_rx) = mpsc::channel::<Frame>(self.capacity.max(1));
            let (in_tx, in_rx) = mpsc::channel::<Frame>(self.capacity.max(1));
            // Either half ending takes the other down with it.
            let closed = CancellationToken::new();

            let writer_closed = closed.clone();
            tokio::spawn(async move {
                let _guard = writer_closed.clone().drop_guard();
                loop {
                    let frame = tokio::select! {
                        biased;
                        () = writer_closed.cancelled() => return,
                        frame = out_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    let text = match frame.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "dropping unencodable frame");
                            continue;
                        }
                    };
                    tokio::select! {
                        biased;
                        () = writer_closed.cancelled() => return,
                        sent = write.send(Message::Text(text)) => {
                            if let Err(e) = sent {
                                debug!(error = %e, "websocket write failed");
                                return;
                            }
                        }
                    }
                }
                if tokio::time::timeout(CLOSE_TIMEOUT, write.send(Message::Close(None)))
                    .await
                    .is_err()
                {
                    debug!("websocket close handshake timed out");
                }
            });

            let reader_closed = closed;
            tokio::spawn(async move {
                let _guard = reader_closed.clone().drop_guard();
                loop {
                    let message = tokio::select! {
                        biased;
                        () = reader_closed.cancelled() => break,
                        () = in_tx.closed() => break,
                        message = read.next() => match message {
                            Some(message) => message,
                            None => break,
                        },
                    };
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(error = %e, "websocket read failed");
                            break;
                        }
                    };
                    match Frame::from_json(&text) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed frame"),
                    }
                }
            });

            Ok(FrameChannel {
                tx: out_tx,
                rx: in_rx,
            })
        })
    }
}

impl From<mpsc::error::SendError<Frame>> for ClientError {
    fn from(_: mpsc::error::SendError<Frame>) -> Self {
        Self::Transport("connection closed".to_string())
    }
}

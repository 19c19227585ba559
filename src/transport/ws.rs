//! WebSocket transport over tokio-tungstenite.
//!
//! [`WsTransport::prepare`] validates the URL and returns the transport half
//! (what the connection writes to) and a [`WsDriver`] (the task that opens the
//! socket and reports its lifecycle). The transport exists before the socket
//! does; frames sent early wait in the writer queue.
//!
//! # Example
//!
//! ```ignore
//! let (transport, driver) = WsTransport::prepare("ws://127.0.0.1:8080")?;
//! let dispatcher = conn.attach(Arc::new(transport));
//! tokio::spawn(driver.run(dispatcher));
//! ```

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use super::Transport;
use crate::bus::CloseInfo;
use crate::dispatcher::{Dispatcher, Frame, TransportEvent};
use crate::error::{BridgeError, Result};
use crate::writer::{spawn_writer_task, OutboundQueue, WriterHandle};

/// Close code when the peer sent a close frame without a status.
const NO_STATUS_CODE: u16 = 1005;

/// Write side of a WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsTransport {
    writer: WriterHandle,
}

/// Opens the socket and pumps its events into a [`Dispatcher`].
#[derive(Debug)]
pub struct WsDriver {
    url: String,
    request: Request,
    queue: OutboundQueue,
}

impl WsTransport {
    /// Validate `url` and create the transport and its driver.
    pub fn prepare(url: &str) -> Result<(WsTransport, WsDriver)> {
        let request = url
            .into_client_request()
            .map_err(|e| BridgeError::InvalidUrl(format!("{}: {}", url, e)))?;
        let (writer, queue) = WriterHandle::channel();

        Ok((
            WsTransport { writer },
            WsDriver {
                url: url.to_string(),
                request,
                queue,
            },
        ))
    }
}

impl Transport for WsTransport {
    fn send_text(&self, frame: String) -> Result<()> {
        self.writer.send(frame)
    }

    fn close(&self) {
        self.writer.close();
    }
}

impl WsDriver {
    /// The URL this driver connects to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect, then report open/message/error/close until the socket ends.
    pub async fn run(self, dispatcher: Dispatcher) {
        let WsDriver {
            url,
            request,
            queue,
        } = self;

        tracing::debug!(%url, "connecting");
        let stream = match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                tracing::error!(%url, error = %e, "WebSocket connect failed");
                dispatcher.handle(TransportEvent::Error(e.to_string()));
                dispatcher.handle(TransportEvent::Close(CloseInfo::abnormal(e.to_string())));
                return;
            }
        };

        let (sink, stream) = stream.split();
        let writer = spawn_writer_task(queue, sink);

        dispatcher.handle(TransportEvent::Open);
        let close = read_loop(stream, &dispatcher).await;
        writer.abort();

        tracing::debug!(%url, code = close.code, reason = %close.reason, "socket closed");
        dispatcher.handle(TransportEvent::Close(close));
    }
}

/// Feed inbound WebSocket messages to `dispatcher` until the stream ends.
///
/// Returns the close details. Read errors are reported as
/// [`TransportEvent::Error`] before returning.
pub async fn read_loop<S>(mut stream: S, dispatcher: &Dispatcher) -> CloseInfo
where
    S: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(item) = stream.next().await {
        match item {
            Ok(WsMessage::Text(text)) => {
                dispatcher.handle(TransportEvent::Message(Frame::Text(text.to_string())));
            }
            Ok(WsMessage::Binary(data)) => {
                dispatcher.handle(TransportEvent::Message(Frame::Binary(Bytes::from(data))));
            }
            Ok(WsMessage::Close(frame)) => {
                return frame
                    .map(|cf| CloseInfo {
                        code: cf.code.into(),
                        reason: cf.reason.to_string(),
                    })
                    .unwrap_or(CloseInfo {
                        code: NO_STATUS_CODE,
                        reason: String::new(),
                    });
            }
            // Ping, pong, raw frames
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket read error");
                dispatcher.handle(TransportEvent::Error(e.to_string()));
                return CloseInfo::abnormal(e.to_string());
            }
        }
    }

    CloseInfo::abnormal("stream ended")
}

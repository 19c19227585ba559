//! Dedicated writer task for outbound text frames.
//!
//! Callers never touch the socket directly. They push frames into an
//! unbounded channel and a single task drains it into the WebSocket sink,
//! which keeps `send` non-blocking and preserves issuance order.
//!
//! # Architecture
//!
//! ```text
//! Topic A   ─┐
//! Service B ─┼─► mpsc::UnboundedSender<Outbound> ─► Writer Task ─► WebSocket sink
//! Topic C   ─┘
//! ```
//!
//! Frames that are already queued when the task wakes are fed as one batch
//! and flushed once.

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{BridgeError, Result};

/// Maximum frames to feed before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// An instruction for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a text frame.
    Text(String),
    /// Send a close frame and stop.
    Close,
}

/// Receiving end of the writer channel.
pub type OutboundQueue = mpsc::UnboundedReceiver<Outbound>;

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable. The task stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl WriterHandle {
    /// Create a handle and the queue a writer task will drain.
    ///
    /// Frames sent before the task starts wait in the queue.
    pub fn channel() -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a text frame.
    pub fn send(&self, text: String) -> Result<()> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close(&self) {
        if self.tx.send(Outbound::Close).is_err() {
            tracing::trace!("writer already stopped");
        }
    }
}

/// Spawn a writer task draining `queue` into an already-connected sink.
///
/// A sink error stops the task and is logged.
pub fn spawn_writer_task<S>(queue: OutboundQueue, sink: S) -> JoinHandle<()>
where
    S: Sink<WsMessage> + Unpin + Send + 'static,
    S::Error: Into<BridgeError>,
{
    tokio::spawn(async move {
        match writer_loop(queue, sink).await {
            Ok(()) => tracing::trace!("writer stopped"),
            Err(e) => tracing::warn!(error = %e, "writer stopped"),
        }
    })
}

/// Drain `queue` into `sink` until a close request or until every handle is dropped.
pub async fn writer_loop<S>(mut queue: OutboundQueue, mut sink: S) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Into<BridgeError>,
{
    loop {
        let first = match queue.recv().await {
            Some(outbound) => outbound,
            None => {
                // Every handle dropped
                sink.close().await.map_err(Into::into)?;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match queue.try_recv() {
                Ok(outbound) => batch.push(outbound),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        for outbound in batch {
            match outbound {
                Outbound::Text(text) => {
                    sink.feed(WsMessage::Text(text.into()))
                        .await
                        .map_err(Into::into)?;
                }
                Outbound::Close => {
                    tracing::debug!("writer closing sink");
                    sink.flush().await.map_err(Into::into)?;
                    sink.close().await.map_err(Into::into)?;
                    return Ok(());
                }
            }
        }

        sink.flush().await.map_err(Into::into)?;
        tracing::trace!(frames = batch_size, "writer flushed batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(messages: &[WsMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                WsMessage::Text(t) => Some(t.to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (handle, queue) = WriterHandle::channel();
        for i in 0..10 {
            handle.send(format!("frame-{}", i)).unwrap();
        }
        drop(handle);

        let mut sink: Vec<WsMessage> = Vec::new();
        writer_loop(queue, &mut sink).await.unwrap();

        let expected: Vec<String> = (0..10).map(|i| format!("frame-{}", i)).collect();
        assert_eq!(texts(&sink), expected);
    }

    #[tokio::test]
    async fn test_close_stops_after_pending_frames() {
        let (handle, queue) = WriterHandle::channel();
        handle.send("before".into()).unwrap();
        handle.close();
        handle.send("after".into()).unwrap();

        let mut sink: Vec<WsMessage> = Vec::new();
        writer_loop(queue, &mut sink).await.unwrap();

        assert_eq!(texts(&sink), vec!["before".to_string()]);
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (handle, queue) = WriterHandle::channel();
        drop(queue);

        assert!(matches!(
            handle.send("late".into()),
            Err(BridgeError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_spawned_writer_stops_when_handles_dropped() {
        let (handle, queue) = WriterHandle::channel();
        let task = spawn_writer_task(queue, Vec::<WsMessage>::new());
        handle.send("x".into()).unwrap();
        drop(handle);

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawned_writer_stops_on_close() {
        let (handle, queue) = WriterHandle::channel();
        let task = spawn_writer_task(queue, Vec::<WsMessage>::new());
        handle.close();

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.send("late".into()).is_err());
    }
}

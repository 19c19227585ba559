//! Topic listener - print messages published on `/path`.
//!
//! This demo shows:
//! - Subscribing with a handler
//! - Watching connection events on the bus
//! - Automatic re-subscription after the server restarts and the demo reconnects
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=mrpt_ws_client=debug,listener=info cargo run --example listener -- ws://127.0.0.1:3000
//! ```

use std::time::Duration;

use mrpt_ws_client::{BusEvent, Channel, Connection, Topic};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:3000".to_string());

    let conn = Connection::builder().url(&url).build()?;

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    conn.bus().on(Channel::Closed, move |event| {
        if let BusEvent::Closed(info) = event {
            tracing::info!(code = info.code, reason = %info.reason, "connection closed");
            let _ = closed_tx.send(());
        }
    });
    conn.bus().on(Channel::Error, |event| {
        if let BusEvent::Error(error) = event {
            tracing::warn!(%error, "transport error");
        }
    });

    let path = Topic::builder(&conn, "/path")
        .message_type("nav_msgs/Path")
        .throttle_rate(100)
        .on_warning(|warning| tracing::warn!(%warning, "topic option corrected"))
        .build();
    path.subscribe(|message| tracing::info!(msg = %message.as_value(), "/path"))?;

    // The core does not reopen sockets; reconnect here and let the topic re-subscribe
    while closed_rx.recv().await.is_some() {
        tokio::time::sleep(Duration::from_secs(1)).await;
        tracing::info!(%url, "reconnecting");
        conn.connect(&url)?;
    }
    Ok(())
}

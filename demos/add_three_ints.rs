//! Service caller - add three integers on the server.
//!
//! This demo shows:
//! - Callback-style calls with separate success and failure handlers
//! - Async calls with a timeout
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=info cargo run --example add_three_ints -- ws://127.0.0.1:3000
//! ```

use std::time::Duration;

use mrpt_ws_client::{Connection, Service};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Debug)]
struct AddRequest {
    a: i64,
    b: i64,
    c: i64,
}

#[derive(Deserialize, Debug)]
struct AddResponse {
    sum: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:3000".to_string());

    let conn = Connection::builder()
        .url(&url)
        .call_timeout(Duration::from_secs(5))
        .build()?;
    let adder = Service::new(&conn, "add_three_ints").with_service_type("AddThreeInts");

    // Callback style
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    adder.call_service(
        &AddRequest { a: 1, b: 2, c: 3 },
        move |response| {
            match response.parse::<AddResponse>() {
                Ok(added) => tracing::info!(sum = added.sum, "callback response"),
                Err(e) => tracing::warn!(error = %e, "unexpected response shape"),
            }
            let _ = done_tx.send(());
        },
        |failure| tracing::error!(%failure, "add_three_ints failed"),
    )?;
    let _ = tokio::time::timeout(Duration::from_secs(5), done_rx).await;

    // Async style
    let response = adder.call(&AddRequest { a: 5, b: 7, c: 10 }).await?;
    let added: AddResponse = response.parse()?;
    tracing::info!(sum = added.sum, "async response");

    conn.close();
    Ok(())
}

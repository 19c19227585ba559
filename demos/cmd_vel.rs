//! Velocity publisher - publish Twist messages on `/cmd_vel`.
//!
//! This demo shows:
//! - Building a connection with the fluent builder
//! - Publishing typed messages (the topic advertises itself on first publish)
//! - Installing a tracing subscriber to see the client's logs
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=mrpt_ws_client=debug cargo run --example cmd_vel -- ws://127.0.0.1:3000
//! ```

use std::time::Duration;

use mrpt_ws_client::{Connection, Topic};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Debug, Default)]
struct Vector3 {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Serialize, Debug, Default)]
struct Twist {
    linear: Vector3,
    angular: Vector3,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:3000".to_string());

    let conn = Connection::builder().url(&url).build()?;
    let cmd_vel = Topic::new(&conn, "/cmd_vel", "geometry_msgs/Twist");

    // Frames published before the socket opens are queued and flushed in order
    for step in 0..10 {
        let twist = Twist {
            linear: Vector3 {
                x: 0.1 * step as f64,
                ..Default::default()
            },
            angular: Vector3 {
                z: -0.1,
                ..Default::default()
            },
        };
        cmd_vel.publish(&twist)?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    cmd_vel.unadvertise()?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.close();
    Ok(())
}

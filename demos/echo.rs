//! In-process echo demo.
//!
//! Starts a node named "Server" that answers every message, then a node
//! named "Client" that connects, pings, and sends a few requests.
//!
//! ```text
//! RUST_LOG=peerwire=debug cargo run --example echo
//! ```

use std::time::Duration;

use peerwire::{BroadcastOptions, Node, NodeConfig, NodeEvent, SendOptions, Target, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("peerwire=info".parse()?),
        )
        .init();

    let (server, mut server_events) = Node::new("Server", NodeConfig::default());
    let addr = server.listen(Target::localhost(0)).await?;

    tokio::spawn(async move {
        while let Some(event) = server_events.recv().await {
            match event {
                NodeEvent::Message(message) => {
                    let answer = match message.data() {
                        Value::String(text) if text == "Hello" => Value::from("World"),
                        other => other.clone(),
                    };
                    if let Err(e) = message.reply(answer).await {
                        tracing::warn!(error = %e, "reply failed");
                    }
                }
                NodeEvent::Ready { peer, .. } => tracing::info!(%peer, "server: peer ready"),
                NodeEvent::Disconnected { peer, .. } => tracing::info!(?peer, "server: peer gone"),
                _ => {}
            }
        }
    });

    let (client, _client_events) = Node::new("Client", NodeConfig::default());
    let connection = client.connect_to(addr).await?;

    tracing::info!(latency = ?connection.ping().await?, "ping");
    tracing::info!(name = %connection.identify().await?, "identify");

    let reply = client.send_to("Server", "Hello", SendOptions::default()).await?;
    tracing::info!(?reply, "Hello ->");

    let options = SendOptions::default().with_timeout(Duration::from_secs(1));
    let reply = client.send_to("Server", Value::Array(vec![1i64.into(), "two".into()]), options).await?;
    tracing::info!(?reply, "echo ->");

    let replies = client.broadcast("to everyone", BroadcastOptions::default()).await?;
    tracing::info!(?replies, "broadcast ->");

    client.close().await;
    server.close().await;
    Ok(())
}

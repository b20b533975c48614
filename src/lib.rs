//! # peerwire
//!
//! Peer-to-peer framed messaging over TCP.
//!
//! Independent processes ("nodes") listen for and dial each other, exchange
//! length-prefixed binary frames, and optionally correlate a reply to each
//! message as if it were a request/response call.
//!
//! ## Architecture
//!
//! - **Wire format**: 11-byte big-endian header (48-bit frame id, receptive
//!   flag, body length) followed by a codec-encoded body
//! - **Handshake**: peers exchange logical names before any traffic; a node
//!   addresses peers by name from then on
//! - **Correlation**: a receptive send waits for the frame that reuses its id
//! - **Reconnection**: dialed connections redial after unexpected drops,
//!   unless the peer announced the close with `$vclose`
//!
//! ## Example
//!
//! ```no_run
//! use peerwire::{Node, NodeConfig, NodeEvent, SendOptions, Target};
//!
//! #[tokio::main]
//! async fn main() -> peerwire::Result<()> {
//!     let (node, mut events) = Node::new("worker", NodeConfig::default());
//!     node.connect_to("127.0.0.1:8000".parse::<Target>()?).await?;
//!
//!     let latency = node.peer("coordinator").unwrap().ping().await?;
//!     println!("ping {latency:?}");
//!
//!     while let Some(event) = events.recv().await {
//!         if let NodeEvent::Message(message) = event {
//!             message.reply("ack").await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod pending;
pub mod protocol;
pub mod queue;
pub mod transport;
pub mod writer;

pub use codec::{Codec, MsgPackCodec, TaggedCodec, Value};
pub use config::{ClientConfig, NodeConfig, Retries, ServerConfig};
pub use connection::{Connection, ConnectionId, ConnectionStatus, InboundMessage, Role, SendOptions};
pub use error::{PeerwireError, Result};
pub use node::{BroadcastOptions, Node, NodeBuilder, NodeEvent};
pub use transport::Target;

//! Integration tests for peerwire.
//!
//! These tests run real nodes against each other over loopback TCP. Where a
//! misbehaving peer is needed, a raw socket speaks the wire format by hand.

use std::net::SocketAddr;
use std::time::Duration;

use peerwire::codec::TaggedCodec;
use peerwire::protocol::{build_frame, decode_header, FrameId, HEADER_SIZE, VCLOSE};
use peerwire::{
    BroadcastOptions, ClientConfig, MsgPackCodec, Node, NodeConfig, NodeEvent, PeerwireError,
    Retries, SendOptions, Target, Value,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

/// Answer every message with a fixed value.
fn respond_with(mut events: Receiver<NodeEvent>, reply: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let NodeEvent::Message(message) = event {
                let _ = message.reply(reply).await;
            }
        }
    })
}

/// Wait for the first event matching `pred`.
async fn next_event<F>(events: &mut Receiver<NodeEvent>, mut pred: F) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn listening(name: &str, config: NodeConfig) -> (Node, Receiver<NodeEvent>, SocketAddr) {
    let (node, events) = Node::new(name, config);
    let addr = node.listen(Target::localhost(0)).await.unwrap();
    (node, events, addr)
}

fn encoded(id: FrameId, receptive: bool, value: impl Into<Value>) -> Vec<u8> {
    build_frame(id, receptive, &TaggedCodec::encode(&value.into()).unwrap())
}

async fn read_raw_frame(socket: &mut TcpStream) -> (FrameId, Value) {
    let mut header = [0u8; HEADER_SIZE];
    socket.read_exact(&mut header).await.unwrap();
    let header = decode_header(&header).unwrap();
    let mut body = vec![0u8; header.body_length as usize];
    socket.read_exact(&mut body).await.unwrap();
    (header.id, TaggedCodec::decode(&body).unwrap())
}

/// Accept one socket and play the server side of the handshake by hand.
async fn raw_server_accept(listener: &TcpListener, name: &str) -> TcpStream {
    let (mut socket, _) = listener.accept().await.unwrap();
    let id = FrameId::from_parts(100, 1);
    socket.write_all(&encoded(id, false, name)).await.unwrap();
    let (reply_id, _client_name) = read_raw_frame(&mut socket).await;
    assert_eq!(reply_id, id, "handshake reply must reuse the id");
    socket
}

fn client_config(retries: Retries, retry_time: Option<Duration>) -> NodeConfig {
    NodeConfig::default().with_client(
        ClientConfig::default()
            .with_maximum_retries(retries)
            .with_retry_time(retry_time),
    )
}

#[tokio::test]
async fn test_hello_world() {
    let (_server, server_events, addr) = listening("Server", NodeConfig::default()).await;
    respond_with(server_events, "World");

    let (client, _client_events) = Node::new("Client", NodeConfig::default());
    let connection = client.connect_to(addr).await.unwrap();
    assert_eq!(connection.peer_name().as_deref(), Some("Server"));
    assert_eq!(client.peers(), vec!["Server"]);

    let reply = client.send_to("Server", "Hello", SendOptions::default()).await.unwrap();
    assert_eq!(reply, Some(Value::from("World")));
}

#[tokio::test]
async fn test_server_sees_client_name() {
    let (server, mut server_events, addr) = listening("Server", NodeConfig::default()).await;
    let (client, client_events) = Node::new("Client", NodeConfig::default());
    respond_with(client_events, "from client");

    client.connect_to(addr).await.unwrap();
    let ready = next_event(&mut server_events, |e| matches!(e, NodeEvent::Ready { .. })).await;
    assert!(matches!(ready, NodeEvent::Ready { peer, .. } if peer == "Client"));

    let reply = server.send_to("Client", "question", SendOptions::default()).await.unwrap();
    assert_eq!(reply, Some(Value::from("from client")));
}

#[tokio::test]
async fn test_server_close_rejects_pending_with_disconnected() {
    let (server, mut server_events, addr) = listening("Server", NodeConfig::default()).await;
    let (client, _client_events) = Node::new("Client", NodeConfig::default());
    client.connect_to(addr).await.unwrap();
    next_event(&mut server_events, |e| matches!(e, NodeEvent::Ready { .. })).await;

    let request = tokio::spawn(async move {
        let options = SendOptions::default().with_timeout(Duration::from_millis(250));
        let result = client.send_to("Server", "unanswered", options).await;
        (client, result)
    });

    next_event(&mut server_events, |e| matches!(e, NodeEvent::Message(_))).await;
    server.close().await;

    let (client, result) = request.await.unwrap();
    assert!(
        matches!(result, Err(PeerwireError::Disconnected)),
        "expected disconnect, got {result:?}"
    );
    assert_eq!(result.unwrap_err().to_string(), "Socket has been disconnected");
    drop(client);
}

#[tokio::test]
async fn test_request_timeout() {
    let (_server, _server_events, addr) = listening("Server", NodeConfig::default()).await;
    let (client, _client_events) = Node::new("Client", NodeConfig::default());
    client.connect_to(addr).await.unwrap();

    let started = tokio::time::Instant::now();
    let options = SendOptions::default().with_timeout(Duration::from_millis(100));
    let result = client.send_to("Server", "ignored", options).await;

    assert!(matches!(result, Err(PeerwireError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.peer("Server").unwrap().pending_requests(), 0);
}

#[tokio::test]
async fn test_unknown_type_tag_keeps_connection_usable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, mut events) = Node::new("Client", NodeConfig::default());

    let (connection, socket) = tokio::join!(client.connect_to(addr), raw_server_accept(&listener, "Raw"));
    let connection = connection.unwrap();
    let mut socket = socket;

    socket
        .write_all(&build_frame(FrameId::from_parts(7, 1), false, &[255]))
        .await
        .unwrap();
    let error = next_event(&mut events, |e| matches!(e, NodeEvent::Error { .. })).await;
    match error {
        NodeEvent::Error { connection: id, error } => {
            assert_eq!(id, connection.id());
            assert!(matches!(error, PeerwireError::Codec(_)));
        }
        _ => unreachable!(),
    }

    socket
        .write_all(&encoded(FrameId::from_parts(7, 2), true, "after"))
        .await
        .unwrap();
    let message = next_event(&mut events, |e| matches!(e, NodeEvent::Message(_))).await;
    let NodeEvent::Message(message) = message else { unreachable!() };
    assert_eq!(message.data(), &Value::from("after"));
    message.reply("still alive").await.unwrap();

    let (id, value) = read_raw_frame(&mut socket).await;
    assert_eq!(id, FrameId::from_parts(7, 2));
    assert_eq!(value, Value::from("still alive"));
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_zero_retries_never_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = client_config(Retries::Limited(0), Some(Duration::from_millis(10)));
    let (client, mut events) = Node::new("Client", config);

    let (connection, socket) = tokio::join!(client.connect_to(addr), raw_server_accept(&listener, "Raw"));
    let connection = connection.unwrap();

    let first = next_event(&mut events, |e| matches!(e, NodeEvent::Connecting { .. })).await;
    assert_eq!(first.connection(), connection.id());

    drop(socket);
    let mut connecting_after_loss = 0;
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                NodeEvent::Connecting { .. } => connecting_after_loss += 1,
                NodeEvent::Disconnected { .. } => break,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(connecting_after_loss, 0);
    assert!(client.peers().is_empty());
}

#[tokio::test]
async fn test_dropped_connection_is_reestablished() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = client_config(Retries::Limited(3), Some(Duration::from_millis(20)));
    let (client, mut events) = Node::new("Client", config);

    let (connection, socket) = tokio::join!(client.connect_to(addr), raw_server_accept(&listener, "Raw"));
    let connection = connection.unwrap();
    next_event(&mut events, |e| matches!(e, NodeEvent::Ready { .. })).await;

    drop(socket);
    let mut socket = raw_server_accept(&listener, "Raw").await;
    next_event(&mut events, |e| matches!(e, NodeEvent::Ready { .. })).await;

    // Same logical connection, new socket.
    assert_eq!(client.peer("Raw").unwrap().id(), connection.id());
    let request = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send("over the new socket", SendOptions::default()).await }
    });
    let (id, value) = read_raw_frame(&mut socket).await;
    assert_eq!(value, Value::from("over the new socket"));
    socket.write_all(&encoded(id, false, "ok")).await.unwrap();
    assert_eq!(request.await.unwrap().unwrap(), Some(Value::from("ok")));
}

#[tokio::test]
async fn test_vclose_prevents_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = client_config(Retries::Unlimited, Some(Duration::from_millis(10)));
    let (client, mut events) = Node::new("Client", config);

    let (connection, socket) = tokio::join!(client.connect_to(addr), raw_server_accept(&listener, "Raw"));
    let connection = connection.unwrap();
    let mut socket = socket;

    socket.write_all(&encoded(FrameId::ZERO, false, VCLOSE)).await.unwrap();
    drop(socket);

    next_event(&mut events, |e| matches!(e, NodeEvent::Disconnected { .. })).await;
    assert!(connection.is_closed());
    assert!(client.peers().is_empty());
}

#[tokio::test]
async fn test_fire_and_forget_resolves_without_reply() {
    let (_server, mut server_events, addr) = listening("Server", NodeConfig::default()).await;
    let (client, _client_events) = Node::new("Client", NodeConfig::default());
    client.connect_to(addr).await.unwrap();

    let result = client
        .send_to("Server", "note", SendOptions::fire_and_forget())
        .await
        .unwrap();
    assert_eq!(result, None);

    let message = next_event(&mut server_events, |e| matches!(e, NodeEvent::Message(_))).await;
    let NodeEvent::Message(message) = message else { unreachable!() };
    assert!(!message.receptive());
    assert_eq!(message.peer(), Some("Client"));
}

#[tokio::test]
async fn test_out_of_order_replies() {
    let (_server, mut server_events, addr) = listening("Server", NodeConfig::default()).await;
    let (client, _client_events) = Node::new("Client", NodeConfig::default());
    client.connect_to(addr).await.unwrap();

    let responder = tokio::spawn(async move {
        let mut held = Vec::new();
        while held.len() < 2 {
            if let Some(NodeEvent::Message(message)) = server_events.recv().await {
                held.push(message);
            }
        }
        for message in held.into_iter().rev() {
            let echo = format!("re:{}", message.data().as_str().unwrap());
            message.reply(echo).await.unwrap();
        }
    });

    let (first, second) = tokio::join!(
        client.send_to("Server", "one", SendOptions::default()),
        client.send_to("Server", "two", SendOptions::default()),
    );
    responder.await.unwrap();

    assert_eq!(first.unwrap(), Some(Value::from("re:one")));
    assert_eq!(second.unwrap(), Some(Value::from("re:two")));
}

#[tokio::test]
async fn test_ping_and_identify() {
    let (_server, _server_events, addr) = listening("Server", NodeConfig::default()).await;
    let (client, mut client_events) = Node::new("Client", NodeConfig::default());
    let connection = client.connect_to(addr).await.unwrap();

    let latency = connection.ping().await.unwrap();
    assert!(latency < WAIT);
    assert_eq!(connection.identify().await.unwrap(), "Server");

    // Neither probe surfaced as an application message.
    while let Ok(event) = client_events.try_recv() {
        assert!(!matches!(event, NodeEvent::Message(_)));
    }
}

#[tokio::test]
async fn test_duplicate_name_evicts_older_peer() {
    let (server, mut server_events, addr) = listening("Server", NodeConfig::default()).await;
    let (first, mut first_events) = Node::new("Twin", NodeConfig::default());
    let (second, _second_events) = Node::new("Twin", NodeConfig::default());

    let first_connection = first.connect_to(addr).await.unwrap();
    next_event(&mut server_events, |e| matches!(e, NodeEvent::Ready { .. })).await;
    second.connect_to(addr).await.unwrap();
    next_event(&mut server_events, |e| matches!(e, NodeEvent::Ready { .. })).await;

    next_event(&mut first_events, |e| matches!(e, NodeEvent::Disconnected { .. })).await;
    assert!(first_connection.is_closed());
    assert_eq!(server.peers(), vec!["Twin"]);

    respond_with(server_events, "hi twin");
    let reply = second.send_to("Server", "hello", SendOptions::default()).await.unwrap();
    assert_eq!(reply, Some(Value::from("hi twin")));
}

#[tokio::test]
async fn test_broadcast_with_filter() {
    let (server, mut server_events, addr) = listening("Hub", NodeConfig::default()).await;

    let mut nodes = Vec::new();
    for name in ["gamma", "alpha", "beta"] {
        let (node, events) = Node::new(name, NodeConfig::default());
        respond_with(events, name);
        node.connect_to(addr).await.unwrap();
        nodes.push(node);
    }
    for _ in 0..3 {
        next_event(&mut server_events, |e| matches!(e, NodeEvent::Ready { .. })).await;
    }

    let all = server.broadcast("who", BroadcastOptions::default()).await.unwrap();
    assert_eq!(
        all,
        vec![Some(Value::from("alpha")), Some(Value::from("beta")), Some(Value::from("gamma"))]
    );

    let options = BroadcastOptions::default().with_pattern("^(alpha|beta)$").unwrap();
    let some = server.broadcast("who", options).await.unwrap();
    assert_eq!(some, vec![Some(Value::from("alpha")), Some(Value::from("beta"))]);

    let quiet = server
        .broadcast("psst", BroadcastOptions::default().with_receptive(false))
        .await
        .unwrap();
    assert_eq!(quiet, vec![None, None, None]);
}

#[tokio::test]
async fn test_disconnect_from_is_terminal_for_both_sides() {
    let (server, mut server_events, addr) = listening("Server", NodeConfig::default()).await;
    let config = client_config(Retries::Unlimited, Some(Duration::from_millis(10)));
    let (client, mut client_events) = Node::new("Client", config);
    client.connect_to(addr).await.unwrap();
    next_event(&mut server_events, |e| matches!(e, NodeEvent::Ready { .. })).await;

    assert!(server.disconnect_from("Client").await);
    assert!(!server.disconnect_from("Client").await);

    next_event(&mut client_events, |e| matches!(e, NodeEvent::Disconnected { .. })).await;
    assert!(client.peers().is_empty());
    assert!(matches!(
        client.send_to("Server", "gone", SendOptions::default()).await,
        Err(PeerwireError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_handshake_timeout_against_silent_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = NodeConfig::default().with_client(
        ClientConfig::default().with_handshake_timeout(Some(Duration::from_millis(100))),
    );
    let (client, _events) = Node::new("Client", config);

    let (result, _socket) = tokio::join!(client.connect_to(addr), listener.accept());
    assert!(matches!(result, Err(PeerwireError::HandshakeTimeout)));
    assert!(client.peers().is_empty());
}

#[tokio::test]
async fn test_msgpack_nodes_talk() {
    let (server, server_events) = Node::builder("Server").codec(MsgPackCodec).build();
    let addr = server.listen(Target::localhost(0)).await.unwrap();
    respond_with(server_events, "World");

    let (client, _events) = Node::builder("Client").codec(MsgPackCodec).build();
    client.connect_to(addr).await.unwrap();

    let reply = client
        .send_to("Server", Value::Array(vec![Value::Int(1), Value::from("two")]), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, Some(Value::from("World")));
}

#[tokio::test]
async fn test_raw_bytes_are_reported() {
    let (_server, server_events, addr) = listening("Server", NodeConfig::default()).await;
    respond_with(server_events, "World");
    let (client, mut events) = Node::new("Client", NodeConfig::default());
    client.connect_to(addr).await.unwrap();

    client.send_to("Server", "Hello", SendOptions::default()).await.unwrap();
    let data = next_event(&mut events, |e| matches!(e, NodeEvent::Data { .. })).await;
    let NodeEvent::Data { bytes, .. } = data else { unreachable!() };
    assert!(bytes.len() >= HEADER_SIZE);
}

#[tokio::test]
async fn test_reconnect_under_new_name_replaces_registry_entry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = client_config(Retries::Limited(3), Some(Duration::from_millis(20)));
    let (client, mut events) = Node::new("Client", config);

    let (connection, socket) = tokio::join!(client.connect_to(addr), raw_server_accept(&listener, "Old"));
    let connection = connection.unwrap();
    assert_eq!(client.peers(), vec!["Old"]);

    drop(socket);
    let _socket = raw_server_accept(&listener, "New").await;
    let renamed = next_event(&mut events, |e| {
        matches!(e, NodeEvent::PeerIdentified { peer, .. } if peer == "New")
    })
    .await;
    assert_eq!(renamed.connection(), connection.id());

    assert_eq!(client.peers(), vec!["New"]);
    assert_eq!(connection.peer_name().as_deref(), Some("New"));
    assert_eq!(client.peer("New").unwrap().id(), connection.id());
    assert!(matches!(
        client.send_to("Old", "anyone?", SendOptions::default()).await,
        Err(PeerwireError::NotConnected(name)) if name == "Old"
    ));
}

#[tokio::test]
async fn test_undrained_events_stay_bounded() {
    let (server, mut server_events, addr) = listening("Server", NodeConfig::default()).await;
    let (client, mut client_events) = Node::new("Client", NodeConfig::default().with_event_capacity(8));
    client.connect_to(addr).await.unwrap();
    next_event(&mut server_events, |e| matches!(e, NodeEvent::Ready { .. })).await;

    let payload = "x".repeat(64 * 1024);
    for _ in 0..200 {
        server
            .send_to("Client", payload.as_str(), SendOptions::fire_and_forget())
            .await
            .unwrap();
    }
    // Answered by the client's reader after every earlier frame.
    server.peer("Client").unwrap().ping().await.unwrap();

    let mut held = 0;
    while client_events.try_recv().is_ok() {
        held += 1;
    }
    assert!(held <= 8, "receiver held {held} events");
    assert!(client.dropped_events() > 0);

    // The connection itself is unaffected.
    assert!(client.peer("Server").unwrap().ping().await.is_ok());
}

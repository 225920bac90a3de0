//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on an ephemeral port backed by an in-memory
//! repository and drives it with [`CollabClient`]s.

use std::sync::Arc;

use codesync_collab::client::{ClientEvent, CollabClient, ConnectionState};
use codesync_collab::protocol::{ClientMessage, ServerMessage};
use codesync_collab::revision::MemoryRevisionLog;
use codesync_collab::server::{ServerConfig, SyncServer};
use codesync_collab::session::MemberStatus;
use codesync_collab::storage::MemoryStore;
use codesync_collab::{AnonymousAuthenticator, Operation};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    server: Arc<SyncServer>,
    store: Arc<MemoryStore>,
    url: String,
    serving: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let store = Arc::new(
            MemoryStore::new()
                .with_file("repo", "main.rs", "helloworld")
                .with_file("other", "main.rs", "fn main() {}")
                .with_file("default", "notes.txt", "scratch"),
        );
        let server = Arc::new(SyncServer::with_parts(
            ServerConfig::default(),
            store.clone(),
            Arc::new(MemoryRevisionLog::new()),
            Arc::new(AnonymousAuthenticator),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let serve = Arc::clone(&server);
        let serving = tokio::spawn(async move {
            serve.serve(listener).await.unwrap();
        });

        Self { server, store, url, serving }
    }

    fn token(&self, resource: &str) -> String {
        self.server.registry().generate_token(resource)
    }

    /// Connect a client and wait for its first server message.
    async fn join(
        &self,
        token: Option<String>,
    ) -> (CollabClient, mpsc::Receiver<ClientEvent>, ServerMessage) {
        let mut client = CollabClient::new(self.url.clone(), token);
        let mut events = client.take_event_rx().unwrap();
        client.connect().await.unwrap();
        let first = next_message(&mut events).await;
        (client, events, first)
    }
}

/// Next server message, skipping lifecycle events.
async fn next_message(events: &mut mpsc::Receiver<ClientEvent>) -> ServerMessage {
    loop {
        match timeout(WAIT, events.recv()).await {
            Ok(Some(ClientEvent::Message(msg))) => return msg,
            Ok(Some(ClientEvent::Connected)) => continue,
            Ok(Some(ClientEvent::Disconnected)) | Ok(None) => panic!("connection closed"),
            Err(_) => panic!("timed out waiting for a server message"),
        }
    }
}

/// Skip messages until one of the given kind arrives.
async fn wait_for_kind(events: &mut mpsc::Receiver<ClientEvent>, kind: &str) -> ServerMessage {
    loop {
        let msg = next_message(events).await;
        if msg.kind() == kind {
            return msg;
        }
    }
}

/// Assert nothing arrives for a short while.
async fn assert_silent(events: &mut mpsc::Receiver<ClientEvent>) {
    if let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

#[tokio::test]
async fn test_solo_mode_without_token() {
    let server = TestServer::start().await;
    let (client, mut events, first) = server.join(None).await;
    assert!(matches!(first, ServerMessage::SoloMode { .. }));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    client.send(ClientMessage::open_file("notes.txt")).await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::FileData { file_id, content, .. } => {
            assert_eq!(file_id, "notes.txt");
            assert_eq!(content, "scratch");
        }
        other => panic!("expected fileData, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_token_falls_back_to_solo() {
    let server = TestServer::start().await;
    let (_client, _events, first) = server.join(Some("not-a-token".into())).await;
    assert!(matches!(first, ServerMessage::SoloMode { .. }));
}

#[tokio::test]
async fn test_two_members_join_and_relay_operation() {
    let server = TestServer::start().await;
    let token = server.token("repo");

    let (alice, mut alice_events, first) = server.join(Some(token.clone())).await;
    let alice_id = match first {
        ServerMessage::Connected { repository, user_id, users } => {
            assert_eq!(repository, "repo");
            assert_eq!(users.len(), 1);
            user_id
        }
        other => panic!("expected connected, got {other:?}"),
    };

    let (bob, mut bob_events, first) = server.join(Some(token.clone())).await;
    let bob_id = match first {
        ServerMessage::Connected { user_id, users, .. } => {
            assert_eq!(users.len(), 2);
            user_id
        }
        other => panic!("expected connected, got {other:?}"),
    };
    match next_message(&mut bob_events).await {
        ServerMessage::UserJoined { user } => assert_eq!(user.id, alice_id),
        other => panic!("expected user_joined, got {other:?}"),
    }
    match next_message(&mut alice_events).await {
        ServerMessage::UserJoined { user } => assert_eq!(user.id, bob_id),
        other => panic!("expected user_joined, got {other:?}"),
    }

    alice.send(ClientMessage::open_file("main.rs")).await.unwrap();
    wait_for_kind(&mut alice_events, "fileData").await;
    match next_message(&mut bob_events).await {
        ServerMessage::FileOpened { user_id, file_id } => {
            assert_eq!(user_id, alice_id);
            assert_eq!(file_id, "main.rs");
        }
        other => panic!("expected file_opened, got {other:?}"),
    }

    bob.send(ClientMessage::open_file("main.rs")).await.unwrap();
    wait_for_kind(&mut bob_events, "fileData").await;
    wait_for_kind(&mut alice_events, "file_opened").await;

    let op = Operation::new().retain(5).insert("X").delete(2).retain(3);
    alice.send(ClientMessage::operation("main.rs", op.clone(), 0)).await.unwrap();
    match next_message(&mut bob_events).await {
        ServerMessage::Operation { file_id, operation, revision } => {
            assert_eq!(file_id, "main.rs");
            assert_eq!(operation.apply("helloworld").unwrap(), "helloXrld");
            assert_eq!(revision, 1);
        }
        other => panic!("expected operation, got {other:?}"),
    }
    assert_silent(&mut alice_events).await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = TestServer::start().await;
    let (alice, mut alice_events, _) = server.join(Some(server.token("repo"))).await;
    let (_carol, mut carol_events, first) = server.join(Some(server.token("other"))).await;
    assert!(matches!(first, ServerMessage::Connected { .. }));

    alice.send(ClientMessage::open_file("main.rs")).await.unwrap();
    wait_for_kind(&mut alice_events, "fileData").await;
    alice
        .send(ClientMessage::code_update("main.rs", "goodbye"))
        .await
        .unwrap();

    assert_silent(&mut carol_events).await;
}

#[tokio::test]
async fn test_save_persists_and_notifies_everyone() {
    let server = TestServer::start().await;
    let token = server.token("repo");
    let (alice, mut alice_events, _) = server.join(Some(token.clone())).await;
    let (bob, mut bob_events, _) = server.join(Some(token)).await;
    wait_for_kind(&mut alice_events, "user_joined").await;

    alice.send(ClientMessage::open_file("main.rs")).await.unwrap();
    wait_for_kind(&mut alice_events, "fileData").await;
    bob.send(ClientMessage::open_file("main.rs")).await.unwrap();
    wait_for_kind(&mut bob_events, "fileData").await;

    let op = Operation::new().insert(">> ").retain(10);
    bob.send(ClientMessage::operation("main.rs", op, 0)).await.unwrap();
    wait_for_kind(&mut alice_events, "operation").await;

    alice.send(ClientMessage::save_file("main.rs")).await.unwrap();
    assert!(matches!(
        wait_for_kind(&mut alice_events, "saved").await,
        ServerMessage::Saved { .. }
    ));
    wait_for_kind(&mut bob_events, "saved").await;
    assert_eq!(server.store.get("repo", "main.rs").as_deref(), Some(">> helloworld"));
}

#[tokio::test]
async fn test_status_update_and_departure() {
    let server = TestServer::start().await;
    let token = server.token("repo");
    let (mut alice, _alice_events, _) = server.join(Some(token.clone())).await;
    let (_bob, mut bob_events, _) = server.join(Some(token.clone())).await;
    wait_for_kind(&mut bob_events, "user_joined").await;

    alice
        .send(ClientMessage::StatusUpdate { status: MemberStatus::Away })
        .await
        .unwrap();
    match wait_for_kind(&mut bob_events, "user_status_changed").await {
        ServerMessage::UserStatusChanged { user } => assert_eq!(user.status, MemberStatus::Away),
        other => panic!("unexpected {other:?}"),
    }

    alice.close().await;
    match wait_for_kind(&mut bob_events, "user_left").await {
        ServerMessage::UserLeft { remaining_users, .. } => assert_eq!(remaining_users.len(), 1),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(server.server.registry().get_connections(&token).len(), 1);
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let server = TestServer::start().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url.as_str()).await.unwrap();

    ws.send(Message::text("{not json")).await.unwrap();
    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let msg = ServerMessage::decode(reply.to_text().unwrap()).unwrap();
    assert!(matches!(msg, ServerMessage::Error { .. }));

    ws.send(Message::text(ClientMessage::init(None).encode().unwrap()))
        .await
        .unwrap();
    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let msg = ServerMessage::decode(reply.to_text().unwrap()).unwrap();
    assert!(matches!(msg, ServerMessage::SoloMode { .. }));
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let server = TestServer::start().await;
    let (client, mut events, _) = server.join(None).await;

    server.server.shutdown_handle().shutdown();
    loop {
        match timeout(WAIT, events.recv()).await {
            Ok(Some(ClientEvent::Disconnected)) | Ok(None) => break,
            Ok(Some(_)) => continue,
            Err(_) => panic!("client was not disconnected"),
        }
    }
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

    // The socket closes before the connection finishes its teardown.
    timeout(WAIT, async {
        while server.server.stats().active_connections != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection teardown did not finish");
}

/// Wait until the client reports its socket closed.
async fn wait_disconnected(events: &mut mpsc::Receiver<ClientEvent>) {
    loop {
        match timeout(WAIT, events.recv()).await {
            Ok(Some(ClientEvent::Disconnected)) | Ok(None) => return,
            Ok(Some(_)) => continue,
            Err(_) => panic!("client was not disconnected"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_with_room_members_editing() {
    let server = TestServer::start().await;
    let token = server.token("repo");

    let (alice, mut alice_events, _) = server.join(Some(token.clone())).await;
    let (bob, mut bob_events, _) = server.join(Some(token.clone())).await;
    alice.send(ClientMessage::open_file("main.rs")).await.unwrap();
    wait_for_kind(&mut alice_events, "fileData").await;
    bob.send(ClientMessage::open_file("main.rs")).await.unwrap();
    wait_for_kind(&mut bob_events, "fileData").await;
    alice
        .send(ClientMessage::operation("main.rs", Operation::new().insert("!").retain(10), 0))
        .await
        .unwrap();
    wait_for_kind(&mut bob_events, "operation").await;

    server.server.shutdown_handle().shutdown();
    wait_disconnected(&mut alice_events).await;
    wait_disconnected(&mut bob_events).await;
    timeout(WAIT, server.serving)
        .await
        .expect("serve loop did not stop")
        .unwrap();

    let state = server.server.state();
    timeout(WAIT, async {
        while !state.registry.get_connections(&token).is_empty() || !state.files.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("members and file sessions were not released");
}

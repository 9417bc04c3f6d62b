//! End-to-end tests against a real server over WebSockets.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use parley_core::{ClientEvent, ConversationStarted, Message, SendPrivateMessage, ServerEvent};
use parley_server::{ServerConfig, ServerHandle};
use parley_store::{ConversationStore, Database, HistoryLimits, SqliteConversationStore};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn boot_server() -> ServerHandle {
    let store = SqliteConversationStore::new(Database::in_memory().unwrap(), HistoryLimits::default());
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    parley_server::start(config, Arc::new(store)).await.unwrap()
}

async fn connect(server: &ServerHandle) -> WsStream {
    let url = format!("ws://127.0.0.1:{}/ws", server.port);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut WsStream, event: ClientEvent) {
    ws.send(WsMessage::text(event.to_frame().unwrap())).await.unwrap();
}

/// Read the next server event, skipping control frames.
async fn read_event(ws: &mut WsStream) -> ServerEvent {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream closed")
            .expect("ws error");
        if let WsMessage::Text(text) = msg {
            return ServerEvent::from_frame(&text).unwrap();
        }
    }
}

/// Assert that nothing arrives within a short window.
async fn expect_silence(ws: &mut WsStream) {
    let quiet = timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return text.to_string(),
                Some(Ok(_)) => continue,
                _ => return String::new(),
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
}

async fn login(server: &ServerHandle, username: &str) -> (WsStream, Vec<String>) {
    let mut ws = connect(server).await;
    send(&mut ws, ClientEvent::Login(username.into())).await;
    match read_event(&mut ws).await {
        ServerEvent::UsersList(users) => (ws, users),
        other => panic!("expected users_list, got {other:?}"),
    }
}

fn private(target: &str, body: &str) -> ClientEvent {
    ClientEvent::SendPrivateMessage(SendPrivateMessage::new(target, body))
}

async fn wait_for_online(server: &ServerHandle, expected: usize) {
    for _ in 0..50 {
        if server.state().router.sessions().online_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("online count never reached {expected}");
}

#[tokio::test]
async fn e2e_presence_conversation_and_disconnect() {
    let server = boot_server().await;

    let (mut a, users) = login(&server, "A").await;
    assert!(users.is_empty());

    let (mut b, users) = login(&server, "B").await;
    assert_eq!(users, vec!["A"]);
    assert_eq!(read_event(&mut a).await, ServerEvent::UserOnline("B".into()));

    send(&mut a, ClientEvent::StartConversation("B".into())).await;
    match read_event(&mut a).await {
        ServerEvent::ConversationStarted(ConversationStarted {
            target_user,
            messages,
            ..
        }) => {
            assert_eq!(target_user, "B");
            assert!(messages.is_empty());
        }
        other => panic!("expected conversation_started, got {other:?}"),
    }

    send(&mut a, private("B", "hi")).await;
    for ws in [&mut a, &mut b] {
        match read_event(ws).await {
            ServerEvent::ReceivePrivateMessage(msg) => {
                assert_eq!(msg.sender, "A");
                assert_eq!(msg.target_user, "B");
                assert_eq!(msg.body, "hi");
            }
            other => panic!("expected receive_private_message, got {other:?}"),
        }
    }

    b.close(None).await.unwrap();
    assert_eq!(read_event(&mut a).await, ServerEvent::UserOffline("B".into()));
    server.shutdown();
}

#[tokio::test]
async fn e2e_message_to_offline_user_is_readable_later() {
    let server = boot_server().await;
    let (mut a, _) = login(&server, "alice").await;

    send(&mut a, private("carol", "are you there?")).await;
    let ServerEvent::ReceivePrivateMessage(sent) = read_event(&mut a).await else {
        panic!("sender should get its own copy");
    };

    let (mut c, users) = login(&server, "carol").await;
    assert_eq!(users, vec!["alice"]);
    send(&mut c, ClientEvent::StartConversation("alice".into())).await;
    match read_event(&mut c).await {
        ServerEvent::ConversationStarted(started) => assert_eq!(started.messages, vec![sent]),
        other => panic!("expected conversation_started, got {other:?}"),
    }
    server.shutdown();
}

#[tokio::test]
async fn e2e_superseded_connection_close_is_silent() {
    let server = boot_server().await;
    let (mut bob, _) = login(&server, "bob").await;
    let (mut old, _) = login(&server, "alice").await;
    assert_eq!(read_event(&mut bob).await, ServerEvent::UserOnline("alice".into()));
    let (mut new, users) = login(&server, "alice").await;
    assert_eq!(users, vec!["bob"]);
    assert_eq!(read_event(&mut bob).await, ServerEvent::UserOnline("alice".into()));

    old.close(None).await.unwrap();
    expect_silence(&mut bob).await;
    wait_for_online(&server, 2).await;

    send(&mut bob, private("alice", "which tab?")).await;
    let _echo = read_event(&mut bob).await;
    match read_event(&mut new).await {
        ServerEvent::ReceivePrivateMessage(msg) => assert_eq!(msg.body, "which tab?"),
        other => panic!("expected message on newest connection, got {other:?}"),
    }
    server.shutdown();
}

#[tokio::test]
async fn e2e_noise_is_ignored() {
    let server = boot_server().await;
    let (mut bob, _) = login(&server, "bob").await;

    let mut anon = connect(&server).await;
    anon.send(WsMessage::text("not json")).await.unwrap();
    anon.send(WsMessage::text(r#"{"event":"join","data":"x"}"#)).await.unwrap();
    send(&mut anon, private("bob", "who am I?")).await;
    send(&mut anon, ClientEvent::Typing("bob".into())).await;
    expect_silence(&mut bob).await;
    expect_silence(&mut anon).await;

    // The connection is still usable after the noise.
    send(&mut anon, ClientEvent::Login("anna".into())).await;
    assert_eq!(read_event(&mut anon).await, ServerEvent::UsersList(vec!["bob".into()]));
    server.shutdown();
}

#[tokio::test]
async fn e2e_typing_reaches_target() {
    let server = boot_server().await;
    let (mut a, _) = login(&server, "alice").await;
    let (mut b, _) = login(&server, "bob").await;
    let _ = read_event(&mut a).await; // user_online bob

    send(&mut a, ClientEvent::Typing("bob".into())).await;
    send(&mut a, ClientEvent::StopTyping("bob".into())).await;
    assert_eq!(read_event(&mut b).await, ServerEvent::UserTyping("alice".into()));
    assert_eq!(read_event(&mut b).await, ServerEvent::UserStopTyping("alice".into()));
    server.shutdown();
}

#[tokio::test]
async fn e2e_history_is_bounded() {
    let server = boot_server().await;
    let (mut a, _) = login(&server, "alice").await;

    for i in 1..=101 {
        send(&mut a, private("bob", &format!("#{i}"))).await;
        let _ = read_event(&mut a).await;
    }

    let url = format!("http://127.0.0.1:{}/api/conversation/alice/bob", server.port);
    let recent: Vec<Message> = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(recent.len(), 50);
    assert_eq!(recent.first().unwrap().body, "#52");
    assert_eq!(recent.last().unwrap().body, "#101");

    let id = parley_core::ConversationId::between("alice", "bob");
    assert_eq!(server.state().router.store().count(&id).await.unwrap(), 100);
    server.shutdown();
}

#[tokio::test]
async fn e2e_health_counts_connections_and_users() {
    let server = boot_server().await;
    let (_a, _) = login(&server, "alice").await;
    let _anon = connect(&server).await;

    let url = format!("http://127.0.0.1:{}/api/health", server.port);
    let mut body = serde_json::Value::Null;
    for _ in 0..50 {
        body = reqwest::get(&url).await.unwrap().json().await.unwrap();
        if body["connections"] == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(body["status"], "OK");
    assert_eq!(body["connections"], 2);
    assert_eq!(body["online"], 1);
    server.shutdown();
}

//! End-to-end tests over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use squid_collab::{
    BoardClient, BoardServer, Event, EventType, MemoryStore, NewColumn, NewProject, ServerConfig,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Start a server on a free port over an in-memory store.
async fn start_test_server() -> (u16, Arc<BoardServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(BoardServer::new(
        ServerConfig::default(),
        Arc::new(MemoryStore::new()),
    ));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (port, server)
}

/// Connect as `user` and wait until the server has registered the socket.
async fn connect(
    server: &BoardServer,
    port: u16,
    user: Uuid,
) -> (BoardClient, mpsc::Receiver<Event>) {
    let mut client = BoardClient::new(user, format!("ws://127.0.0.1:{port}"));
    let rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    tokio::time::timeout(RECV_TIMEOUT, async {
        while !server.registry().is_connected(user).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server never registered the connection");
    (client, rx)
}

async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let (port, server) = start_test_server().await;
    let (client, mut rx) = connect(&server, port, Uuid::new_v4()).await;

    client.ping().await.unwrap();
    let reply = next_event(&mut rx).await;
    assert_eq!(reply.event_type, EventType::Pong);
    assert_eq!(reply.message, "pong");
    assert_eq!(server.stats().total_connections, 1);
}

#[tokio::test]
async fn test_unknown_frames_get_undefined() {
    let (port, server) = start_test_server().await;
    let (client, mut rx) = connect(&server, port, Uuid::new_v4()).await;

    client.send_raw("definitely not json").await.unwrap();
    let reply = next_event(&mut rx).await;
    assert_eq!(reply.event_type, EventType::Undefined);
    assert_eq!(reply.message, "undefined event");

    // Well-formed, but clients have no business sending mutations.
    client
        .send_event(&Event::new(
            EventType::ColumnCreated,
            "column created",
            serde_json::json!([]),
        ))
        .await
        .unwrap();
    assert_eq!(next_event(&mut rx).await.event_type, EventType::Undefined);

    // The connection survives both.
    client.ping().await.unwrap();
    assert_eq!(next_event(&mut rx).await.event_type, EventType::Pong);
}

#[tokio::test]
async fn test_handshake_without_user_is_rejected() {
    let (port, server) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err(), "handshake without a user id must fail");

    tokio::time::timeout(RECV_TIMEOUT, async {
        while server.stats().rejected_handshakes == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(server.registry().connection_count().await, 0);
}

#[tokio::test]
async fn test_mutation_reaches_participants_not_outsiders() {
    let (port, server) = start_test_server().await;
    let service = server.service().clone();
    let (creator, member, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let project = service
        .create_project(
            creator,
            NewProject {
                name: "Launch".into(),
                member_ids: vec![member],
                ..NewProject::default()
            },
        )
        .await
        .unwrap();

    let (_c, mut creator_rx) = connect(&server, port, creator).await;
    let (_m, mut member_rx) = connect(&server, port, member).await;
    let (_x, mut outsider_rx) = connect(&server, port, outsider).await;

    let change = service
        .create_column(
            creator,
            NewColumn {
                project_id: project.id,
                name: "Backlog".into(),
                order: 1,
                label_id: None,
            },
        )
        .await
        .unwrap();
    let expected = serde_json::to_value(&change.columns).unwrap();

    for rx in [&mut creator_rx, &mut member_rx] {
        let event = next_event(rx).await;
        assert_eq!(event.event_type, EventType::ColumnCreated);
        assert_eq!(event.payload, expected);
    }
    let leaked = tokio::time::timeout(Duration::from_millis(200), outsider_rx.recv()).await;
    assert!(leaked.is_err(), "outsider received {leaked:?}");
}

#[tokio::test]
async fn test_disconnect_deregisters() {
    let (port, server) = start_test_server().await;
    let user = Uuid::new_v4();
    let (mut first, _rx1) = connect(&server, port, user).await;
    let (_second, _rx2) = connect(&server, port, user).await;

    tokio::time::timeout(RECV_TIMEOUT, async {
        while server.registry().connection_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    first.disconnect().await;
    tokio::time::timeout(RECV_TIMEOUT, async {
        while server.registry().connection_count().await != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(server.registry().is_connected(user).await);
}

use cognitive_mirrors::client::{ApiError, CognitiveApi, CognitiveApiClient};
use cognitive_mirrors::engine::HeuristicEngine;
use cognitive_mirrors::local_store::ProfileCache;
use cognitive_mirrors::models::{EventSubmission, SessionStart, SessionStatus};
use cognitive_mirrors::rate_limit::RateLimiter;
use cognitive_mirrors::relay::{ConnectionState, ServerMessage};
use cognitive_mirrors::server::{create_router, AppState};
use cognitive_mirrors::shell::{AppContext, LaunchOptions, ShellState, ShellStep};
use cognitive_mirrors::store::DocumentStore;
use cognitive_mirrors::tracker::EventTracker;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn puzzles() -> Vec<String> {
    vec!["ego_labyrinth".into(), "memory_maze".into()]
}

/// Serve `state` on an ephemeral port and return a client pointed at it.
async fn spawn_server(state: AppState) -> (SocketAddr, Arc<CognitiveApiClient>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state, &[]);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    let client =
        CognitiveApiClient::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
    (addr, Arc::new(client))
}

fn memory_state() -> AppState {
    AppState::new(
        DocumentStore::in_memory(),
        Arc::new(HeuristicEngine::new()),
        RateLimiter::disabled(),
        puzzles(),
    )
}

fn event(session_id: &str, event_type: &str) -> EventSubmission {
    EventSubmission {
        session_id: session_id.into(),
        event_type: event_type.into(),
        payload: json!({"node": event_type}),
        timestamp: None,
    }
}

/// Session lifecycle over real HTTP: start → events → complete → conflicts
#[tokio::test]
async fn test_session_lifecycle_over_http() {
    let (_, api) = spawn_server(memory_state()).await;

    let health = api.health_check().await;
    assert!(health.healthy, "health: {:?}", health.error);

    let session = api
        .create_session(&SessionStart::new("u1", "ego_labyrinth"))
        .await
        .unwrap();
    assert!(!session.session_id.is_empty());
    assert_eq!(session.status, SessionStatus::Active);

    for kind in ["move", "move", "undo", "hint"] {
        let receipt = api.submit_event(&event(&session.session_id, kind)).await;
        assert!(receipt.unwrap().success);
    }

    let done = api
        .complete_session(&session.session_id, &json!({"score": 42}))
        .await
        .unwrap();
    assert!(done.success);
    assert_eq!(done.metrics.event_count, 4);
    assert_eq!(done.metrics.score, Some(42.0));
    assert!(done.archetype.is_some());

    let again = api
        .complete_session(&session.session_id, &json!({"score": 1}))
        .await
        .unwrap_err();
    assert_eq!(
        again,
        ApiError::Application {
            status: 409,
            message: "session already completed".into()
        }
    );

    // Late events are refused by the server and swallowed by the client.
    assert!(api.submit_event(&event(&session.session_id, "move")).await.is_none());

    let fetched = api.get_session(&session.session_id).await.unwrap();
    assert_eq!(fetched.status, SessionStatus::Completed);

    let missing = api.get_session("nope").await.unwrap_err();
    assert_eq!(missing.status(), Some(404));
}

/// Insight endpoints reflect completed sessions
#[tokio::test]
async fn test_insights_over_http() {
    let (_, api) = spawn_server(memory_state()).await;

    for user in ["u1", "u2"] {
        let s = api
            .create_session(&SessionStart::new(user, "ego_labyrinth"))
            .await
            .unwrap();
        api.submit_event(&event(&s.session_id, "move")).await;
        api.submit_event(&event(&s.session_id, "hint")).await;
        let viz = api.visualization(&s.session_id).await.unwrap();
        assert_eq!(viz.nodes.len(), 2);
        assert_eq!(viz.edges.len(), 1);
        api.complete_session(&s.session_id, &json!({"score": 70}))
            .await
            .unwrap();
    }

    let insights = api.comparative_insights("u1", None).await.unwrap();
    assert_eq!(insights.sessions_completed, 1);
    assert_eq!(insights.population_size, 2);

    let rec = api.recommendation("u1").await.unwrap();
    assert_eq!(rec.user_id, "u1");
    assert_eq!(rec.puzzle_type, "memory_maze");

    let version = api.version().await.unwrap();
    assert_eq!(version.name, "cognitive-mirrors");
}

/// Shared profiles can be matched against each other
#[tokio::test]
async fn test_share_and_match_over_http() {
    let (_, api) = spawn_server(memory_state()).await;
    let cache = ProfileCache::in_memory();

    for user in ["a", "b", "c"] {
        let profile = cache.load_user_profile(user).unwrap();
        let receipt = api.share_profile(&profile).await.unwrap();
        assert!(!receipt.share_id.is_empty());
    }

    let found = api.find_matches("a", Some(5)).await.unwrap();
    assert_eq!(found.matches.len(), 2);
    assert!(found.matches.iter().all(|m| m.user_id != "a"));
}

/// Application shell start-up and completion against a live backend
#[tokio::test]
async fn test_shell_end_to_end() {
    let (_, api) = spawn_server(memory_state()).await;
    let cache = ProfileCache::in_memory();
    let mut app = AppContext::new(api.clone(), cache, LaunchOptions::new("memory_maze"));

    app.initialize().await.unwrap();
    assert_eq!(app.state(), &ShellState::Ready);
    let session_id = app.session().unwrap().session_id.clone();
    assert!(app.track("move", json!({"x": 1})));
    assert!(app.track("undo", json!({})));

    let receipt = app.complete(json!({"score": 90})).await.unwrap();
    assert_eq!(receipt.session_id, session_id);
    let profile = app.profile().unwrap();
    assert_eq!(profile.sessions.len(), 1);
    assert_eq!(profile.archetype, receipt.archetype);

    let stats = app.shutdown().await.unwrap();
    assert_eq!(stats.dropped + stats.delivered, 3);
}

/// Shell reports the failing step when the backend is down
#[tokio::test]
async fn test_shell_backend_unreachable() {
    let api = Arc::new(
        CognitiveApiClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap(),
    );
    let mut app = AppContext::new(api, ProfileCache::in_memory(), LaunchOptions::new("memory_maze"));

    let err = app.initialize().await.unwrap_err();
    assert_eq!(err.step, ShellStep::HealthCheck);
    assert!(matches!(
        app.state(),
        ShellState::Failed {
            step: ShellStep::HealthCheck,
            ..
        }
    ));
    assert!(app.session().is_none());
}

/// Tracker delivers to a real server in send order
#[tokio::test]
async fn test_tracker_against_server() {
    let state = memory_state();
    let store = state.store.clone();
    let (_, api) = spawn_server(state).await;

    let session = api
        .create_session(&SessionStart::new("u1", "shadow_mirror"))
        .await
        .unwrap();
    let mut tracker = EventTracker::new(api.clone());
    tracker.start(&session);
    for kind in ["a", "b", "c"] {
        tracker.track(kind, json!({}));
    }
    let stats = tracker.shutdown().await;
    assert_eq!(stats.delivered, 4);

    let kinds: Vec<String> = store
        .events_for(&session.session_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(kinds, vec!["session_started", "a", "b", "c"]);
}

/// HTTP events fan out to relay connections joined to the session
#[tokio::test]
async fn test_relay_receives_session_updates() {
    let state = memory_state();
    let relay = state.relay.clone();
    let (_, api) = spawn_server(state).await;

    let session = api
        .create_session(&SessionStart::new("u1", "ego_labyrinth"))
        .await
        .unwrap();
    let (conn, mut inbox) = relay.register();
    relay.mark_open(&conn);
    assert!(relay.join(&conn, &session.session_id));

    api.submit_event(&event(&session.session_id, "move")).await.unwrap();
    match inbox.recv().await.unwrap() {
        ServerMessage::SessionUpdate {
            session_id,
            status,
            event_count,
            ..
        } => {
            assert_eq!(session_id, session.session_id);
            assert_eq!(status, SessionStatus::Active);
            assert_eq!(event_count, 1);
        }
        other => panic!("unexpected message: {:?}", other),
    }

    api.complete_session(&session.session_id, &json!({}))
        .await
        .unwrap();
    match inbox.recv().await.unwrap() {
        ServerMessage::SessionUpdate { status, metrics, .. } => {
            assert_eq!(status, SessionStatus::Completed);
            assert!(metrics.is_some());
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

/// Journaled sessions survive a server restart
#[tokio::test]
async fn test_journal_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let session_id = {
        let state = AppState::new(
            DocumentStore::open(dir.path()).unwrap(),
            Arc::new(HeuristicEngine::new()),
            RateLimiter::disabled(),
            puzzles(),
        );
        let (_, api) = spawn_server(state.clone()).await;
        let s = api
            .create_session(&SessionStart::new("u1", "ego_labyrinth"))
            .await
            .unwrap();
        api.submit_event(&event(&s.session_id, "move")).await.unwrap();
        api.complete_session(&s.session_id, &json!({"score": 10}))
            .await
            .unwrap();
        state.store.flush().await.unwrap();
        s.session_id
    };

    let reopened = DocumentStore::open(dir.path()).unwrap();
    let session = reopened.get_session(&session_id).await.unwrap();
    assert!(session.is_completed());
    assert_eq!(session.metrics.unwrap().score, Some(10.0));
    assert_eq!(reopened.events_for(&session_id).await.unwrap().len(), 1);
}

async fn connect_ws(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    ws
}

/// Next JSON frame from the server, skipping control frames.
async fn recv_message(ws: &mut WsClient) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a relay frame")
            .expect("relay socket ended")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(WsMessage::Text(text.to_string())).await.unwrap();
}

/// Poll until the relay registry drains.
async fn wait_for_no_connections(relay: &cognitive_mirrors::relay::ConnectionManager) {
    for _ in 0..200 {
        if relay.connection_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay still has {} connections", relay.connection_count());
}

/// Relay socket: connected frame, ping, bad frames, join and track, close
#[tokio::test]
async fn test_relay_socket_round_trip() {
    let state = memory_state();
    let relay = state.relay.clone();
    let (addr, api) = spawn_server(state).await;
    let session = api
        .create_session(&SessionStart::new("u1", "ego_labyrinth"))
        .await
        .unwrap();

    let mut ws = connect_ws(addr).await;
    let connection_id = match recv_message(&mut ws).await {
        ServerMessage::Connected {
            connection_id,
            server_version,
        } => {
            assert_eq!(server_version, env!("CARGO_PKG_VERSION"));
            connection_id
        }
        other => panic!("expected connected, got {:?}", other),
    };

    send_text(&mut ws, r#"{"type":"ping"}"#).await;
    assert_eq!(recv_message(&mut ws).await, ServerMessage::Pong);
    assert_eq!(relay.state(&connection_id), ConnectionState::Open);
    assert_eq!(relay.connection_count(), 1);

    // Garbage gets an error reply and the socket stays usable.
    send_text(&mut ws, "not json at all").await;
    match recv_message(&mut ws).await {
        ServerMessage::Error { message } => assert!(message.starts_with("invalid message")),
        other => panic!("expected error, got {:?}", other),
    }
    send_text(&mut ws, r#"{"type":"ping"}"#).await;
    assert_eq!(recv_message(&mut ws).await, ServerMessage::Pong);

    let join = json!({"type": "join_session", "sessionId": session.session_id});
    send_text(&mut ws, &join.to_string()).await;
    assert_eq!(
        recv_message(&mut ws).await,
        ServerMessage::Joined {
            session_id: session.session_id.clone()
        }
    );

    send_text(&mut ws, r#"{"type":"track_event","eventType":"move","payload":{"x":1}}"#).await;
    assert!(matches!(
        recv_message(&mut ws).await,
        ServerMessage::EventAck { .. }
    ));
    match recv_message(&mut ws).await {
        ServerMessage::SessionUpdate { event_count, .. } => assert_eq!(event_count, 1),
        other => panic!("expected session update, got {:?}", other),
    }

    ws.close(None).await.unwrap();
    wait_for_no_connections(&relay).await;
    assert_eq!(relay.state(&connection_id), ConnectionState::Closed);
}

/// Server shutdown hook closes open relay sockets
#[tokio::test]
async fn test_relay_close_all_ends_sockets() {
    let state = memory_state();
    let relay = state.relay.clone();
    let (addr, _) = spawn_server(state).await;

    let mut ws = connect_ws(addr).await;
    assert!(matches!(
        recv_message(&mut ws).await,
        ServerMessage::Connected { .. }
    ));
    send_text(&mut ws, r#"{"type":"ping"}"#).await;
    assert_eq!(recv_message(&mut ws).await, ServerMessage::Pong);

    assert_eq!(relay.close_all(), 1);
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket stayed open after close_all");
    wait_for_no_connections(&relay).await;
}

//! End-to-end tests against an in-process fake gateway.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use gateway_client::{
    ChatSendParams, ChatState, ConnectionState, GatewayClient, GatewayConfig, GatewayError,
};

struct FakeGateway {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<FakeConn>,
}

impl FakeGateway {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(tcp).await {
                    if tx.send(FakeConn { ws }).is_err() {
                        break;
                    }
                }
            }
        });
        Self { addr, conns: rx }
    }

    fn config(&self) -> GatewayConfig {
        let mut config = GatewayConfig::new(format!("ws://{}", self.addr));
        config.token = Some("test-token".into());
        config.connect_timeout = Duration::from_secs(2);
        config.request_timeout = Duration::from_secs(2);
        config.backoff_base = Duration::from_millis(50);
        config.backoff_max = Duration::from_millis(200);
        config
    }

    async fn accept(&mut self) -> FakeConn {
        tokio::time::timeout(Duration::from_secs(5), self.conns.recv())
            .await
            .expect("no connection within 5s")
            .expect("gateway listener stopped")
    }
}

struct FakeConn {
    ws: WebSocketStream<TcpStream>,
}

impl FakeConn {
    async fn send(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    /// Next text frame as JSON, `None` once the client hung up.
    async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    async fn recv_request(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.recv())
            .await
            .expect("no request within 5s")
            .expect("client closed the socket");
        assert_eq!(frame["kind"], "request");
        frame
    }

    async fn respond(&mut self, id: &Value, payload: Value) {
        self.send(json!({"kind": "response", "id": id, "ok": true, "payload": payload}))
            .await;
    }

    /// Run the server side of the handshake and return the connect params.
    async fn handshake(&mut self, tick_interval_ms: u64) -> Value {
        self.send(json!({"kind": "event", "name": "connect.challenge", "payload": {"nonce": "n-1"}}))
            .await;
        let connect = self.recv_request().await;
        assert_eq!(connect["method"], "connect");
        self.respond(
            &connect["id"],
            json!({
                "type": "hello-ok",
                "protocol": 3,
                "server": {"connId": "conn-1"},
                "features": {"methods": ["chat.send"], "events": ["chat", "tick"]},
                "policy": {"maxPayload": 1048576, "tickIntervalMs": tick_interval_ms}
            }),
        )
        .await;
        connect["params"].clone()
    }

    async fn chat_event(&mut self, run_id: &str, seq: u64, state: &str, text: &str) {
        self.send(json!({
            "kind": "event",
            "name": "chat",
            "seq": seq,
            "payload": {
                "runId": run_id,
                "sessionKey": "main",
                "seq": seq,
                "state": state,
                "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}
            }
        }))
        .await;
    }
}

async fn connected(gateway: &mut FakeGateway) -> (GatewayClient, FakeConn) {
    let client = GatewayClient::spawn(gateway.config());
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.ensure_connected().await })
    };
    let mut conn = gateway.accept().await;
    conn.handshake(15_000).await;
    connecting.await.unwrap().unwrap();
    (client, conn)
}

fn send_params(message: &str) -> ChatSendParams {
    ChatSendParams {
        session_key: "main".into(),
        message: message.into(),
        idempotency_key: uuid::Uuid::new_v4().to_string(),
        timeout_ms: None,
        attachments: None,
    }
}

#[tokio::test]
async fn handshake_sends_identity_and_connects() {
    let mut gateway = FakeGateway::start().await;
    let client = GatewayClient::spawn(gateway.config());
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.ensure_connected().await })
    };

    let mut conn = gateway.accept().await;
    let params = conn.handshake(15_000).await;
    connecting.await.unwrap().unwrap();

    assert_eq!(params["minProtocol"], 3);
    assert_eq!(params["maxProtocol"], 3);
    assert_eq!(params["auth"]["token"], "test-token");
    assert_eq!(params["client"]["id"], "chat-relay");
    assert_eq!(params["role"], "operator");

    let mut watch = client.watch_status();
    let status = watch
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap()
        .clone();
    assert_eq!(status.conn_id.as_deref(), Some("conn-1"));
    assert_eq!(status.tick_interval_ms, Some(15_000));

    // Already connected: resolves without another handshake.
    client.ensure_connected().await.unwrap();
}

#[tokio::test]
async fn responses_are_matched_by_id() {
    let mut gateway = FakeGateway::start().await;
    let (client, mut conn) = connected(&mut gateway).await;

    let first = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request("chat.history", json!({"sessionKey": "a"}), Duration::from_secs(2))
                .await
        })
    };
    let req_a = conn.recv_request().await;
    let second = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request("chat.history", json!({"sessionKey": "b"}), Duration::from_secs(2))
                .await
        })
    };
    let req_b = conn.recv_request().await;
    assert_ne!(req_a["id"], req_b["id"]);

    // Answer out of order.
    conn.respond(&req_b["id"], json!({"sessionKey": "b", "messages": []}))
        .await;
    conn.respond(&req_a["id"], json!({"sessionKey": "a", "messages": []}))
        .await;

    assert_eq!(first.await.unwrap().unwrap()["sessionKey"], "a");
    assert_eq!(second.await.unwrap().unwrap()["sessionKey"], "b");
}

#[tokio::test]
async fn structured_error_is_surfaced() {
    let mut gateway = FakeGateway::start().await;
    let (client, mut conn) = connected(&mut gateway).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request("chat.abort", json!({"sessionKey": "main"}), Duration::from_secs(2))
                .await
        })
    };
    let req = conn.recv_request().await;
    conn.send(json!({
        "kind": "response",
        "id": req["id"],
        "ok": false,
        "error": {"code": "UNAVAILABLE", "message": "agent busy", "retryable": true}
    }))
    .await;

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        GatewayError::Remote {
            code: "UNAVAILABLE".into(),
            message: "agent busy".into(),
            retryable: true,
        }
    );
}

#[tokio::test]
async fn close_rejects_pending_with_connection_lost() {
    let mut gateway = FakeGateway::start().await;
    let (client, mut conn) = connected(&mut gateway).await;

    let started = Instant::now();
    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request("chat.history", json!({}), Duration::from_secs(10))
                .await
        })
    };
    conn.recv_request().await;
    conn.ws.close(None).await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, GatewayError::ConnectionLost);
    assert!(started.elapsed() < Duration::from_secs(2));
    let mut watch = client.watch_status();
    watch
        .wait_for(|s| s.state != ConnectionState::Connected)
        .await
        .unwrap();
}

#[tokio::test]
async fn connect_times_out_without_challenge() {
    let mut gateway = FakeGateway::start().await;
    let mut config = gateway.config();
    config.connect_timeout = Duration::from_millis(300);
    let client = GatewayClient::spawn(config);

    let started = Instant::now();
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.ensure_connected().await })
    };
    // Accept the socket but never send the challenge.
    let _conn = gateway.accept().await;

    let err = connecting.await.unwrap().unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err, GatewayError::ConnectTimeout);
    assert!(elapsed >= Duration::from_millis(290), "too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "too late: {elapsed:?}");
}

#[tokio::test]
async fn concurrent_ensure_connected_share_one_attempt() {
    let mut gateway = FakeGateway::start().await;
    let client = GatewayClient::spawn(gateway.config());
    let callers: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.ensure_connected().await })
        })
        .collect();

    let mut conn = gateway.accept().await;
    // Let the second caller reach the supervisor while the handshake is pending.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(gateway.conns.try_recv().is_err());

    conn.handshake(15_000).await;
    for caller in callers {
        caller.await.unwrap().unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.conns.try_recv().is_err(), "a second socket was opened");
}

#[tokio::test]
async fn concurrent_ensure_connected_share_the_timeout() {
    let mut gateway = FakeGateway::start().await;
    let mut config = gateway.config();
    config.connect_timeout = Duration::from_millis(300);
    let client = GatewayClient::spawn(config);

    let started = Instant::now();
    let callers: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.ensure_connected().await })
        })
        .collect();
    // Accept the socket but never send the challenge.
    let _conn = gateway.accept().await;

    for caller in callers {
        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err, GatewayError::ConnectTimeout);
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(290), "too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "too late: {elapsed:?}");
}

#[tokio::test]
async fn rejected_hello_fails_the_attempt() {
    let mut gateway = FakeGateway::start().await;
    let client = GatewayClient::spawn(gateway.config());
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.ensure_connected().await })
    };

    let mut conn = gateway.accept().await;
    conn.send(json!({"kind": "event", "name": "connect.challenge"}))
        .await;
    let connect = conn.recv_request().await;
    conn.send(json!({
        "kind": "response",
        "id": connect["id"],
        "ok": false,
        "error": {"code": "UNAUTHORIZED", "message": "bad token"}
    }))
    .await;

    let err = connecting.await.unwrap().unwrap_err();
    match err {
        GatewayError::ConnectRejected(reason) => assert!(reason.contains("bad token"), "{reason}"),
        other => panic!("Expected ConnectRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn chat_run_streams_every_event_in_order() {
    let mut gateway = FakeGateway::start().await;
    let (client, mut conn) = connected(&mut gateway).await;

    let sending = {
        let client = client.clone();
        tokio::spawn(async move { client.chat_send(send_params("hello")).await })
    };
    let req = conn.recv_request().await;
    assert_eq!(req["method"], "chat.send");
    assert_eq!(req["params"]["message"], "hello");
    assert!(req["params"]["idempotencyKey"].is_string());

    // Events follow the ack immediately; none may be missed.
    conn.respond(&req["id"], json!({"runId": "run-1", "status": "started"}))
        .await;
    conn.chat_event("run-1", 1, "delta", "Hel").await;
    conn.chat_event("run-other", 1, "delta", "nope").await;
    conn.chat_event("run-1", 2, "delta", "Hello").await;
    conn.chat_event("run-1", 3, "final", "Hello!").await;

    let (ack, mut run) = sending.await.unwrap().unwrap();
    assert_eq!(ack.run_id, "run-1");
    assert_eq!(run.run_id(), "run-1");

    let mut seen = Vec::new();
    while let Some(event) = run.next_event().await {
        seen.push((event.seq, event.state, event.text().unwrap_or_default()));
    }
    assert_eq!(
        seen,
        vec![
            (1, ChatState::Delta, "Hel".to_string()),
            (2, ChatState::Delta, "Hello".to_string()),
            (3, ChatState::Final, "Hello!".to_string()),
        ]
    );
    assert!(run.saw_terminal());
}

#[tokio::test]
async fn extra_subscriber_sees_the_same_run() {
    let mut gateway = FakeGateway::start().await;
    let (client, mut conn) = connected(&mut gateway).await;

    let sending = {
        let client = client.clone();
        tokio::spawn(async move { client.chat_send(send_params("hi")).await })
    };
    let req = conn.recv_request().await;
    conn.respond(&req["id"], json!({"runId": "run-2"})).await;
    let (_ack, mut run) = sending.await.unwrap().unwrap();

    let mut watcher = client.subscribe_run("run-2").unwrap();
    // Let the supervisor register the second listener before events flow.
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.chat_event("run-2", 1, "delta", "a").await;
    conn.chat_event("run-2", 2, "aborted", "a").await;

    assert_eq!(run.next_event().await.unwrap().seq, 1);
    assert_eq!(run.next_event().await.unwrap().state, ChatState::Aborted);
    assert_eq!(watcher.next_event().await.unwrap().seq, 1);
    assert_eq!(
        watcher.next_event().await.unwrap().state,
        ChatState::Aborted
    );
    assert!(watcher.next_event().await.is_none());
}

#[tokio::test]
async fn disconnect_ends_run_stream_without_terminal() {
    let mut gateway = FakeGateway::start().await;
    let (client, mut conn) = connected(&mut gateway).await;

    let sending = {
        let client = client.clone();
        tokio::spawn(async move { client.chat_send(send_params("hi")).await })
    };
    let req = conn.recv_request().await;
    conn.respond(&req["id"], json!({"runId": "run-3"})).await;
    conn.chat_event("run-3", 1, "delta", "partial").await;
    let (_ack, mut run) = sending.await.unwrap().unwrap();

    assert_eq!(run.next_event().await.unwrap().state, ChatState::Delta);
    conn.ws.close(None).await.unwrap();

    assert!(run.next_event().await.is_none());
    assert!(!run.saw_terminal());
}

#[tokio::test]
async fn late_response_after_timeout_is_discarded() {
    let mut gateway = FakeGateway::start().await;
    let (client, mut conn) = connected(&mut gateway).await;

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request("chat.history", json!({}), Duration::from_millis(100))
                .await
        })
    };
    let req = conn.recv_request().await;
    let err = slow.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        GatewayError::RequestTimeout {
            method: "chat.history".into(),
            timeout_ms: 100
        }
    );
    conn.respond(&req["id"], json!({"late": true})).await;

    // The connection is still usable afterwards.
    let next = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request("chat.history", json!({}), Duration::from_secs(2))
                .await
        })
    };
    let req = conn.recv_request().await;
    conn.respond(&req["id"], json!({"fresh": true})).await;
    assert_eq!(next.await.unwrap().unwrap(), json!({"fresh": true}));
}

#[tokio::test]
async fn missing_heartbeat_forces_reconnect() {
    let mut gateway = FakeGateway::start().await;
    let client = GatewayClient::spawn(gateway.config());
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.ensure_connected().await })
    };
    let mut first = gateway.accept().await;
    // 100ms ticks: the watchdog fires after 250ms of silence.
    first.handshake(100).await;
    connecting.await.unwrap().unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request("chat.history", json!({}), Duration::from_secs(5))
                .await
        })
    };
    first.recv_request().await;
    assert_eq!(
        pending.await.unwrap().unwrap_err(),
        GatewayError::ConnectionLost
    );

    // The supervisor dials again on its own after the backoff delay.
    let mut second = gateway.accept().await;
    second.handshake(15_000).await;
    let mut status = client.watch_status();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == ConnectionState::Connected),
    )
    .await
    .expect("did not reconnect")
    .unwrap();
    client.ensure_connected().await.unwrap();
}

#[tokio::test]
async fn heartbeats_keep_connection_alive() {
    let mut gateway = FakeGateway::start().await;
    let client = GatewayClient::spawn(gateway.config());
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.ensure_connected().await })
    };
    let mut conn = gateway.accept().await;
    conn.handshake(100).await;
    connecting.await.unwrap().unwrap();

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(80)).await;
        conn.send(json!({"kind": "event", "name": "tick", "payload": {"ts": 1}}))
            .await;
    }
    assert_eq!(client.status().state, ConnectionState::Connected);
}

#[tokio::test]
async fn destroy_closes_socket_and_stops_reconnecting() {
    let mut gateway = FakeGateway::start().await;
    let (client, mut conn) = connected(&mut gateway).await;

    client.destroy().await;
    assert!(
        tokio::time::timeout(Duration::from_secs(2), conn.recv())
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(client.ensure_connected().await, Err(GatewayError::Destroyed));
    assert!(
        tokio::time::timeout(Duration::from_millis(300), gateway.conns.recv())
            .await
            .is_err()
    );
}

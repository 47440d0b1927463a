//! Websocket session tests against a loopback server.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use bandbot::bybit::sign;
use bandbot::bybit::ws::{SessionEvent, SessionState, WsSession, WsTiming};
use bandbot::config::KeyPair;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// Millisecond-scale cadence so heartbeat and reconnect behavior is
/// observable within a test run.
fn fast_timing() -> WsTiming {
    WsTiming {
        ping_interval: Duration::from_millis(400),
        pong_bound: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(100),
    }
}

fn parse(msg: &Message) -> Value {
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

#[tokio::test]
async fn subscribe_and_dispatch() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let sub = parse(&ws.next().await.unwrap().unwrap());
        assert_eq!(sub["op"], "subscribe");
        assert_eq!(sub["args"][0], "kline.1.TESTUSDT");
        ws.send(Message::Text(
            json!({ "op": "subscribe", "success": true }).to_string(),
        ))
        .await
        .unwrap();

        ws.send(Message::Text(
            json!({
                "topic": "kline.1.TESTUSDT",
                "data": [{ "start": 0, "confirm": false }],
            })
            .to_string(),
        ))
        .await
        .unwrap();

        while let Some(Ok(_)) = ws.next().await {}
    });

    let (session, _events) = WsSession::new("test", url, None);
    session.open().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.subscribe(
        "kline.1.TESTUSDT",
        Arc::new(move |frame: &Value| {
            let _ = tx.send(frame.clone());
        }),
    );

    let frame = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no push within 5s")
        .unwrap();
    assert_eq!(frame["topic"], "kline.1.TESTUSDT");
    assert_eq!(frame["data"][0]["start"], 0);

    session.close();
}

#[tokio::test]
async fn auth_handshake_signs_the_challenge() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let auth = parse(&ws.next().await.unwrap().unwrap());
        assert_eq!(auth["op"], "auth");
        assert_eq!(auth["args"][0], "test-key");
        let expires = auth["args"][1].as_i64().unwrap();
        let expected = sign::ws_auth_challenge("test-secret", expires);
        assert_eq!(auth["args"][2], expected.as_str());

        ws.send(Message::Text(
            json!({ "op": "auth", "success": true }).to_string(),
        ))
        .await
        .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let keys = KeyPair {
        api_key: "test-key".into(),
        api_secret: "test-secret".into(),
    };
    let (session, mut events) = WsSession::new("test", url, Some(keys));
    timeout(Duration::from_secs(5), session.open())
        .await
        .expect("open did not resolve")
        .unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    assert_eq!(events.recv().await, Some(SessionEvent::Open));
    assert_eq!(events.recv().await, Some(SessionEvent::Authenticated));

    session.close();
}

#[tokio::test]
async fn rejected_auth_fails_open() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = ws.next().await;
        ws.send(Message::Text(
            json!({ "op": "auth", "success": false, "retMsg": "invalid key" }).to_string(),
        ))
        .await
        .unwrap();
    });

    let keys = KeyPair {
        api_key: "bad-key".into(),
        api_secret: "bad-secret".into(),
    };
    let (session, _events) = WsSession::new("test", url, Some(keys));
    let result = timeout(Duration::from_secs(5), session.open())
        .await
        .expect("open did not resolve");
    assert!(result.is_err());
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn reconnect_replays_subscriptions() {
    let (listener, url) = bind().await;
    let (replayed_tx, mut replayed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        // First connection: take the subscription, then drop the socket.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let sub = parse(&ws.next().await.unwrap().unwrap());
        assert_eq!(sub["op"], "subscribe");
        drop(ws);

        // Second connection: the session must resubscribe unprompted.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let sub = parse(&ws.next().await.unwrap().unwrap());
        let _ = replayed_tx.send(sub);

        ws.send(Message::Text(
            json!({
                "topic": "orderbook.1.TESTUSDT",
                "data": { "b": [["1.0", "100"]], "a": [] },
            })
            .to_string(),
        ))
        .await
        .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (session, mut events) = WsSession::with_timing("test", url, None, fast_timing());
    session.open().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.subscribe(
        "orderbook.1.TESTUSDT",
        Arc::new(move |frame: &Value| {
            let _ = tx.send(frame.clone());
        }),
    );

    let replay = timeout(Duration::from_secs(10), replayed_rx.recv())
        .await
        .expect("no resubscribe within 10s")
        .unwrap();
    assert_eq!(replay["op"], "subscribe");
    assert_eq!(replay["args"][0], "orderbook.1.TESTUSDT");

    // The handler keeps working across the reconnect.
    let frame = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no push after reconnect")
        .unwrap();
    assert_eq!(frame["topic"], "orderbook.1.TESTUSDT");

    // The drop was observable as a lifecycle event.
    let mut saw_reconnecting = false;
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::Reconnecting {
            saw_reconnecting = true;
        }
    }
    assert!(saw_reconnecting);

    session.close();
}

#[tokio::test]
async fn inbound_pongs_defer_client_pings() {
    let (listener, url) = bind().await;
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if ws
                        .send(Message::Text(json!({ "op": "pong" }).to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                msg = ws.next() => {
                    match msg {
                        Some(Ok(msg)) if msg.is_text() => {
                            if parse(&msg)["op"] == "ping" {
                                let _ = ping_tx.send(());
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    }
                }
            }
        }
    });

    let timing = WsTiming {
        ping_interval: Duration::from_millis(500),
        ..fast_timing()
    };
    let (session, _events) = WsSession::with_timing("test", url, None, timing);
    session.open().await.unwrap();

    // Pongs arrive every 100 ms, re-arming the 500 ms ping timer each time:
    // the client must stay silent for the whole window.
    tokio::time::sleep(Duration::from_millis(1_600)).await;
    assert!(
        ping_rx.try_recv().is_err(),
        "client pinged despite steady inbound traffic"
    );

    session.close();
}

#[tokio::test]
async fn unanswered_ping_forces_reconnect() {
    let (listener, url) = bind().await;
    let (redial_tx, mut redial_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        // First connection: swallow everything, never answer the ping.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        tokio::spawn(async move { while let Some(Ok(_)) = ws.next().await {} });

        // The pong bound must drive the client back here.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = redial_tx.send(());
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (session, mut events) = WsSession::with_timing("test", url, None, fast_timing());
    session.open().await.unwrap();

    timeout(Duration::from_secs(5), redial_rx.recv())
        .await
        .expect("no redial after unanswered ping")
        .unwrap();

    let mut saw_reconnecting = false;
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::Reconnecting {
            saw_reconnecting = true;
        }
    }
    assert!(saw_reconnecting);

    session.close();
}

#[tokio::test]
async fn close_during_reconnect_counts_as_initiated() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        // Accept once, drop the socket, then answer no further dials.
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        drop(ws);
        std::future::pending::<()>().await;
    });

    let timing = WsTiming {
        reconnect_delay: Duration::from_millis(400),
        ..fast_timing()
    };
    let (session, mut events) = WsSession::with_timing("test", url, None, timing);
    session.open().await.unwrap();

    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no reconnect event")
            .unwrap();
        if event == SessionEvent::Reconnecting {
            break;
        }
    }
    session.close();

    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no close event")
            .unwrap();
        if let SessionEvent::Closed { initiated } = event {
            assert!(initiated, "user close reported as an unexpected drop");
            break;
        }
    }
    assert_eq!(session.state(), SessionState::Closed);
}

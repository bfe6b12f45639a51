//! Subscription manager against a local WebSocket server
//!
//! Run with: cargo test -p venue-client --test subscription -- --nocapture

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use venue_client::{ClientConfig, Credentials, ReconnectPolicy, SubscriptionManager};
use venue_core::{Topic, UpdateEvent};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

/// Server side of one accepted connection
struct ServerConn {
    incoming: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Option<String>>,
}

impl ServerConn {
    async fn next_frame(&mut self) -> Value {
        timeout(WAIT, self.incoming.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("connection closed")
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(frame)) = timeout(QUIET, self.incoming.recv()).await {
            panic!("unexpected frame {}", frame);
        }
    }

    fn push(&self, text: &str) {
        self.outgoing.send(Some(text.to_string())).unwrap();
    }

    fn close(&self) {
        self.outgoing.send(None).unwrap();
    }
}

async fn start_server() -> (String, mpsc::UnboundedReceiver<ServerConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            let (mut write, mut read) = ws.split();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Option<String>>();

            if conn_tx
                .send(ServerConn {
                    incoming: in_rx,
                    outgoing: out_tx,
                })
                .is_err()
            {
                return;
            }

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                                let _ = in_tx.send(value);
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        },
                        out = out_rx.recv() => match out {
                            Some(Some(text)) => {
                                if write.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            _ => {
                                let _ = write.close().await;
                                break;
                            }
                        },
                    }
                }
            });
        }
    });

    (url, conn_rx)
}

fn config(url: &str, admin: bool) -> ClientConfig {
    ClientConfig {
        ws_url: url.to_string(),
        credentials: Credentials {
            bearer_token: Some("token-1".to_string()),
            admin_token: admin.then(|| "admin-1".to_string()),
        },
        reconnect: ReconnectPolicy {
            base: Duration::from_millis(20),
            max: Duration::from_millis(100),
            jitter_ratio: 0.0,
            max_attempts: None,
        },
        ping_interval: Duration::from_secs(60),
        ..ClientConfig::default()
    }
}

async fn wait_connected(manager: &SubscriptionManager, expected: bool) {
    let mut state = manager.connection_state();
    timeout(WAIT, state.wait_for(|c| *c == expected))
        .await
        .expect("timed out waiting for connection state")
        .unwrap();
}

#[tokio::test]
async fn test_auth_then_single_subscribe_per_topic() {
    let (url, mut conns) = start_server().await;
    let manager = SubscriptionManager::new(config(&url, false));
    let topic = Topic::market("42");

    let card = manager.subscribe(topic.clone(), |_, _| {}).unwrap();
    let mut conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();

    let auth = conn.next_frame().await;
    assert_eq!(auth["type"], "AUTH");
    assert_eq!(auth["token"], "token-1");

    let sub = conn.next_frame().await;
    assert_eq!(sub["type"], "SUBSCRIBE");
    assert_eq!(sub["topic"], "market:42");

    wait_connected(&manager, true).await;

    let detail = manager.subscribe(topic.clone(), |_, _| {}).unwrap();
    conn.assert_quiet().await;

    drop(card);
    conn.assert_quiet().await;

    detail.unsubscribe();
    let unsub = conn.next_frame().await;
    assert_eq!(unsub["type"], "UNSUBSCRIBE");
    assert_eq!(unsub["topic"], "market:42");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_pushed_events_reach_handlers() {
    let (url, mut conns) = start_server().await;
    let manager = SubscriptionManager::new(config(&url, false));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let _sub = manager
        .subscribe(Topic::market("42"), move |topic, event| {
            let _ = event_tx.send((topic.clone(), event.clone()));
        })
        .unwrap();

    let mut conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    conn.next_frame().await;
    conn.next_frame().await;

    conn.push(r#"{"topic":"market:99","type":"NEW_ORDER"}"#);
    conn.push(r#"{"topic":"market:42","type":"ORDER_CANCELLED"}"#);

    let (topic, event) = timeout(WAIT, event_rx.recv()).await.unwrap().unwrap();
    assert_eq!(topic, Topic::market("42"));
    assert_eq!(event, UpdateEvent::OrderCancelled);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_reauths_and_replays_topics() {
    let (url, mut conns) = start_server().await;
    let manager = SubscriptionManager::new(config(&url, true));

    let _market = manager.subscribe(Topic::market("1"), |_, _| {}).unwrap();
    let _admin = manager.subscribe(Topic::AdminMarkets, |_, _| {}).unwrap();

    let mut first = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert_eq!(first.next_frame().await["type"], "AUTH");
    wait_connected(&manager, true).await;

    let mut state = manager.connection_state();
    state.borrow_and_update();
    first.close();
    timeout(WAIT, state.changed()).await.unwrap().unwrap();

    let mut second = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert_eq!(second.next_frame().await["type"], "AUTH");

    let mut replayed = vec![
        second.next_frame().await["topic"].as_str().unwrap().to_string(),
        second.next_frame().await["topic"].as_str().unwrap().to_string(),
    ];
    replayed.sort();
    assert_eq!(replayed, vec!["admin:markets", "market:1"]);

    wait_connected(&manager, true).await;
    second.assert_quiet().await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_token_installed_after_connect_sends_auth() {
    let (url, mut conns) = start_server().await;
    let mut cfg = config(&url, false);
    cfg.credentials.bearer_token = None;
    let manager = SubscriptionManager::new(cfg);

    let _sub = manager.subscribe(Topic::market("5"), |_, _| {}).unwrap();
    let mut conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();

    assert_eq!(conn.next_frame().await["type"], "SUBSCRIBE");
    wait_connected(&manager, true).await;

    manager.set_bearer_token("late-token");
    let auth = conn.next_frame().await;
    assert_eq!(auth["type"], "AUTH");
    assert_eq!(auth["token"], "late-token");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_token_set_during_connect_sends_one_auth() {
    let (url, mut conns) = start_server().await;
    let mut cfg = config(&url, false);
    cfg.credentials.bearer_token = None;
    let manager = SubscriptionManager::new(cfg);

    // Races the handshake: either it carries the token or AUTH follows it
    let _sub = manager.subscribe(Topic::market("5"), |_, _| {}).unwrap();
    manager.set_bearer_token("early-token");

    let mut conn = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    let frames = [conn.next_frame().await, conn.next_frame().await];
    conn.assert_quiet().await;

    let auths: Vec<_> = frames.iter().filter(|f| f["type"] == "AUTH").collect();
    assert_eq!(auths.len(), 1);
    assert_eq!(auths[0]["token"], "early-token");
    assert!(frames
        .iter()
        .any(|f| f["type"] == "SUBSCRIBE" && f["topic"] == "market:5"));

    wait_connected(&manager, true).await;
    manager.shutdown().await;
}

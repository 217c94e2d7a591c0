// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives a real relay over TCP with WebSocket peers and HTTP clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_cache::{CacheLimits, InMemoryRelayCache, RelayCache};
use relay_types::{Frame, Message};
use relayserver::{serve, HttpSettings, RelayRouter, RelaySettings};

type PeerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PATIENCE: Duration = Duration::from_secs(10);
const DATA: &[u8] = b"the quick brown fox jumps over the lazy dog";

struct Relay {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Relay {
    async fn start(cache: Option<Arc<dyn RelayCache>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Arc::new(RelayRouter::new(cache, RelaySettings::default()));
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, router, HttpSettings::default(), async {
            let _ = stopped.await;
        }));
        Self { addr, stop, task }
    }

    fn url(&self, route: &str) -> String {
        format!("http://{}/relay/{route}", self.addr)
    }

    async fn connect(&self, peer_id: &str) -> PeerSocket {
        let (mut socket, _) = connect_async(format!("ws://{}/relay/ws", self.addr))
            .await
            .unwrap();
        let subscribe = Frame::Subscribe {
            peer_id: peer_id.into(),
            topic: "pics".into(),
        };
        socket
            .send(WsMessage::Text(subscribe.to_json()))
            .await
            .unwrap();
        socket
    }

    async fn stop(self) {
        self.stop.send(()).unwrap();
        timeout(PATIENCE, self.task).await.unwrap().unwrap();
    }
}

fn message() -> Message {
    Message {
        key: "k1".into(),
        name: "fox.txt".into(),
        content_type: "text/plain".into(),
        length: DATA.len() as u64,
        topic: "pics".into(),
        alias: "alice".into(),
        timestamp: 1,
    }
}

/// Answers every `requestBlob` with `DATA` until the relay closes the socket.
async fn upload_on_request(mut socket: PeerSocket, relay_addr: SocketAddr) {
    let http = reqwest::Client::new();
    while let Some(Ok(received)) = socket.next().await {
        let WsMessage::Text(text) = received else {
            continue;
        };
        let Ok(Frame::RequestBlob { request_id, .. }) = Frame::parse(&text) else {
            continue;
        };
        let response = http
            .put(format!(
                "http://{relay_addr}/relay/sendBlob?requestId={request_id}"
            ))
            .header("content-type", "text/plain")
            .body(DATA)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

/// Reads frames until a `message` frame arrives.
async fn next_announcement(socket: &mut PeerSocket) -> Message {
    loop {
        let received = socket.next().await.unwrap().unwrap();
        if let WsMessage::Text(text) = received {
            if let Ok(Frame::Message { message }) = Frame::parse(&text) {
                return message;
            }
        }
    }
}

async fn status(relay: &Relay) -> serde_json::Value {
    let response = reqwest::get(relay.url("status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    serde_json::from_str(&response.text().await.unwrap()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn blobs_flow_from_peers_to_http_clients() {
    let cache = Arc::new(InMemoryRelayCache::new(CacheLimits::with_budget(1 << 20)));
    let relay = Relay::start(Some(cache)).await;

    let mut alice = relay.connect("alice").await;
    alice
        .send(WsMessage::Text(Frame::from(message()).to_json()))
        .await
        .unwrap();
    let alice = tokio::spawn(upload_on_request(alice, relay.addr));

    // Bob hears about the blob either by replay or by relay, so it's claimed by now
    let mut bob = relay.connect("bob").await;
    let announced = timeout(PATIENCE, next_announcement(&mut bob)).await.unwrap();
    assert_eq!(announced, message());

    let http = reqwest::Client::new();
    let response = timeout(PATIENCE, http.get(relay.url("getBlob?key=k1")).send())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.bytes().await.unwrap(), DATA);

    let response = http.head(relay.url("getBlob?key=k1")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-length"],
        DATA.len().to_string().as_str()
    );

    let status = status(&relay).await;
    assert_eq!(status["connections"], 2);
    assert_eq!(status["peerMessages"], 1);

    drop(bob);
    relay.stop().await;
    timeout(PATIENCE, alice).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_requests_get_plain_statuses() {
    let relay = Relay::start(None).await;
    let http = reqwest::Client::new();

    let response = http.get(relay.url("getBlob")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.text().await.unwrap(),
        "Bad Request: Missing or empty key parameter"
    );

    let response = http.get(relay.url("getBlob?key=nope")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.text().await.unwrap(),
        "Not Found: No peers found for content: nope"
    );

    let response = http.post(relay.url("getBlob?key=k1")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = http
        .put(relay.url("sendBlob?requestId=nobody-asked"))
        .header("content-type", "text/plain")
        .body("abc")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = http
        .put(relay.url("sendBlob"))
        .header("content-type", "text/plain")
        .body("abc")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = http
        .request(reqwest::Method::OPTIONS, relay.url("sendBlob"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .contains_key("access-control-allow-methods"));

    let response = http.get(relay.url("elsewhere")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = http
        .get(format!("http://{}/other/status", relay.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // A plain GET on the socket route isn't an upgrade
    let response = http.get(relay.url("ws")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn claims_vanish_with_their_peer() {
    let relay = Relay::start(None).await;

    let mut alice = relay.connect("alice").await;
    alice
        .send(WsMessage::Text(Frame::from(message()).to_json()))
        .await
        .unwrap();
    let mut bob = relay.connect("bob").await;
    timeout(PATIENCE, next_announcement(&mut bob)).await.unwrap();
    assert_eq!(status(&relay).await["peerMessages"], 1);

    alice.close(None).await.unwrap();
    timeout(PATIENCE, async {
        while status(&relay).await["peerMessages"] != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(status(&relay).await["connections"], 1);

    let response = reqwest::get(relay.url("getBlob?key=k1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    drop(bob);
    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_peer_sockets() {
    let relay = Relay::start(None).await;
    let mut alice = relay.connect("alice").await;
    // Make sure the subscription has been handled before shutting down
    timeout(PATIENCE, async {
        while status(&relay).await["connections"] != 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    relay.stop().await;
    let closed = timeout(PATIENCE, async {
        loop {
            match alice.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

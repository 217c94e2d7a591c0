// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Upgrading HTTP/1 requests to WebSocket connections

use std::future::Future;

use hyper::header::{
    HeaderMap, HeaderName, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::response::{empty_body, GenericResponse};

/// A server-side WebSocket over an upgraded HTTP connection.
pub type WebSocket = WebSocketStream<TokioIo<Upgraded>>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("not a websocket upgrade request")]
    NotAnUpgrade,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("only websocket version 13 is supported")]
    UnsupportedVersion,
}

/// Whether `request` asks to upgrade to a WebSocket.
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    let headers = request.headers();
    has_token(headers, CONNECTION, "upgrade") && has_token(headers, UPGRADE, "websocket")
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// Accepts a WebSocket upgrade.
///
/// Returns the `101 Switching Protocols` response, which must be sent for the upgrade to
/// happen, and a future resolving to the socket once it has.
pub fn upgrade<B>(
    request: &mut Request<B>,
) -> Result<
    (
        GenericResponse,
        impl Future<Output = Result<WebSocket, hyper::Error>> + Send + 'static,
    ),
    HandshakeError,
> {
    if !is_upgrade_request(request) {
        return Err(HandshakeError::NotAnUpgrade);
    }
    let headers = request.headers();
    if !headers
        .get(SEC_WEBSOCKET_VERSION)
        .is_some_and(|version| version == "13")
    {
        return Err(HandshakeError::UnsupportedVersion);
    }
    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or(HandshakeError::MissingKey)?;
    let accept = derive_accept_key(key.as_bytes());

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty_body())
        .unwrap();

    let on_upgrade = hyper::upgrade::on(request);
    let socket = async move {
        let upgraded = on_upgrade.await?;
        Ok(WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await)
    };
    Ok((response, socket))
}

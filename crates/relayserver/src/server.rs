// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::borrow::Cow;
use std::future::{ready, Future};
use std::sync::Arc;

use anyhow::Context;
use futures::TryStreamExt;
use http_body_util::BodyStream;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn, Instrument};

use minhttp::response::{self, GenericResponse};
use minhttp::server::tcp_connections;
use minhttp::websocket;
use minhttp::Server;
use relay_types::RequestId;

use crate::opts::Config;
use crate::peer::serve_peer;
use crate::router::{RelayRouter, UploadError};
use crate::throttle::throttled;

/// Settings for the HTTP side of the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpSettings {
    /// Always starts and ends with `/`.
    pub base_path: String,
    pub max_connections: usize,
    /// 0 is unthrottled
    pub serve_bytes_per_second: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            base_path: "/relay/".into(),
            max_connections: 1024,
            serve_bytes_per_second: 0,
        }
    }
}

const CORS_HEADERS: [(&str, &str); 4] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET, HEAD, PUT, OPTIONS"),
    (
        "access-control-allow-headers",
        "Content-Type, Content-Length, X-Content-Type, X-Content-Length",
    ),
    ("access-control-expose-headers", "Content-Type, Content-Length"),
];

fn add_cors_headers(response_headers: &mut HeaderMap) {
    for (header, value) in CORS_HEADERS {
        response_headers.insert(
            HeaderName::from_static(header),
            HeaderValue::from_static(value),
        );
    }
}

/// Answers every HTTP request the relay receives.
struct RelayService {
    router: Arc<RelayRouter>,
    settings: HttpSettings,
    shutdown: watch::Receiver<bool>,
}

impl RelayService {
    async fn respond(self: Arc<Self>, request: Request<Incoming>) -> GenericResponse {
        let mut response = match self.route(request.uri().path()) {
            Some(route) => {
                let route = route.to_owned();
                self.handle(&route, request).await
            }
            None => response::not_found(),
        };
        add_cors_headers(response.headers_mut());
        response
    }

    /// The part of `path` below the base path.
    fn route<'a>(&self, path: &'a str) -> Option<&'a str> {
        let base = &self.settings.base_path;
        match path.strip_prefix(base.as_str()) {
            Some(route) => Some(route),
            None if base.strip_suffix('/') == Some(path) => Some(""),
            None => None,
        }
    }

    async fn handle(&self, route: &str, request: Request<Incoming>) -> GenericResponse {
        let method = request.method().clone();
        match (route, method) {
            ("getBlob" | "sendBlob" | "status" | "" | "ws", Method::OPTIONS) => response::empty(),
            ("getBlob", Method::GET) => self.get_blob(request.uri()).await,
            ("getBlob", Method::HEAD) => self.head_blob(request.uri()).await,
            ("getBlob", _) => response::method_not_allowed("GET, HEAD, OPTIONS"),
            ("sendBlob", Method::PUT) => self.send_blob(request).await,
            ("sendBlob", _) => response::method_not_allowed("PUT, OPTIONS"),
            ("status", Method::GET) => {
                let status = self.router.status().await;
                // this serialization can't fail
                response::json(StatusCode::OK, serde_json::to_string(&status).unwrap())
            }
            ("status", _) => response::method_not_allowed("GET, OPTIONS"),
            ("" | "ws", Method::GET) => self.connect_peer(request),
            ("" | "ws", _) => response::method_not_allowed("GET, OPTIONS"),
            _ => response::not_found(),
        }
    }

    async fn get_blob(&self, uri: &Uri) -> GenericResponse {
        let Some(key) = query_param(uri, "key") else {
            return missing_key();
        };
        match self.router.fetch_blob(&key).await {
            Ok(blob) => {
                let body = throttled(blob.stream, self.settings.serve_bytes_per_second);
                response::stream(
                    StatusCode::OK,
                    &blob.content_type,
                    Some(blob.length),
                    body,
                )
            }
            Err(err) => response::text(StatusCode::NOT_FOUND, format!("Not Found: {err}")),
        }
    }

    async fn head_blob(&self, uri: &Uri) -> GenericResponse {
        let Some(key) = query_param(uri, "key") else {
            return missing_key();
        };
        let Some((content_type, length)) = self.router.describe_blob(&key).await else {
            return response::text(StatusCode::NOT_FOUND, format!("Not Found: {key}"));
        };
        let mut response = response::empty();
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
        );
        headers.insert(CONTENT_LENGTH, length.into());
        response
    }

    async fn send_blob(&self, request: Request<Incoming>) -> GenericResponse {
        let request_id = query_param(request.uri(), "requestId").map(|id| RequestId::from(&*id));
        let headers = request.headers();
        let content_type = first_header(headers, "content-type", "x-content-type");
        let content_length = first_header(headers, "content-length", "x-content-length")
            .and_then(|length| length.trim().parse::<u64>().ok());
        let Some(request_id) = request_id else {
            return upload_failed(UploadError::MissingHeaders);
        };

        let body = BodyStream::new(request.into_body())
            .try_filter_map(|frame| ready(Ok(frame.into_data().ok())));
        let result = self
            .router
            .send_blob(&request_id, content_type.as_deref(), content_length, body)
            .await;
        match result {
            Ok(_) => response::text(StatusCode::OK, "File uploaded successfully"),
            Err(err) => upload_failed(err),
        }
    }

    fn connect_peer(&self, mut request: Request<Incoming>) -> GenericResponse {
        if !websocket::is_upgrade_request(&request) {
            return response::text(
                StatusCode::BAD_REQUEST,
                "Bad Request: expected a WebSocket upgrade",
            );
        }
        let (response, upgraded) = match websocket::upgrade(&mut request) {
            Ok(upgrade) => upgrade,
            Err(err) => {
                return response::text(StatusCode::BAD_REQUEST, format!("Bad Request: {err}"))
            }
        };

        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(
            async move {
                match upgraded.await {
                    Ok(socket) => serve_peer(router, socket, shutdown).await,
                    Err(err) => warn!("WebSocket upgrade failed: {err}"),
                }
            }
            .in_current_span(),
        );
        response
    }
}

fn missing_key() -> GenericResponse {
    response::text(
        StatusCode::BAD_REQUEST,
        "Bad Request: Missing or empty key parameter",
    )
}

fn upload_failed(err: UploadError) -> GenericResponse {
    let status = upload_status(&err);
    let mut response = response::text(status, err.to_string());
    if status != StatusCode::BAD_REQUEST {
        // The rest of the upload body is unwanted
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

fn upload_status(err: &UploadError) -> StatusCode {
    match err {
        UploadError::MissingHeaders | UploadError::UnknownRequest(_) => StatusCode::BAD_REQUEST,
        UploadError::Cancelled(_) => StatusCode::GONE,
        UploadError::ReceiverGone
        | UploadError::ReceiverTimeout
        | UploadError::Incomplete { .. }
        | UploadError::Body(_)
        | UploadError::EofTimeout => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The first non-empty value of `name` in the query string.
fn query_param<'a>(uri: &'a Uri, name: &str) -> Option<Cow<'a, str>> {
    let query = uri.query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(param, value)| param == name && !value.is_empty())
        .map(|(_, value)| value)
}

fn first_header(headers: &HeaderMap, name: &str, fallback: &str) -> Option<String> {
    [name, fallback]
        .into_iter()
        .filter_map(|name| headers.get(name)?.to_str().ok())
        .find(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Serves the relay on `listener` until `shutdown` resolves, then shuts down gracefully.
///
/// Peer connections are closed, in-flight HTTP requests are allowed to finish and the cache is
/// closed before this returns.
pub async fn serve(
    listener: TcpListener,
    router: Arc<RelayRouter>,
    settings: HttpSettings,
    shutdown: impl Future<Output = ()>,
) {
    let server = Server::new(settings.max_connections);
    let service = Arc::new(RelayService {
        router: router.clone(),
        settings,
        shutdown: server.shutdown_watch(),
    });

    let connections = tcp_connections(listener);
    tokio::join!(
        server.serve(connections, move |request, _| service.clone().respond(request)),
        async {
            shutdown.await;
            info!("Shutting down");
            server.graceful_shutdown().await;
        }
    );

    if let Some(cache) = router.cache() {
        cache.close().await;
    }
    info!("Relay stopped");
}

/// Opens the configured cache, binds the configured address and serves until `shutdown`
/// resolves.
pub async fn run(config: Config, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let cache = config.open_cache().await?;
    let router = Arc::new(RelayRouter::new(cache, config.relay_settings()));
    let listener = TcpListener::bind(config.port)
        .await
        .with_context(|| format!("Couldn't bind to {}", config.port))?;
    let http_settings = config.http_settings();
    info!(
        "Relay listening on {} under {}",
        listener.local_addr()?,
        http_settings.base_path
    );
    serve(listener, router, http_settings, shutdown).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::router::RelaySettings;

    fn relay_service(base_path: &str) -> RelayService {
        let (_, shutdown) = watch::channel(false);
        RelayService {
            router: Arc::new(RelayRouter::new(None, RelaySettings::default())),
            settings: HttpSettings {
                base_path: base_path.into(),
                ..HttpSettings::default()
            },
            shutdown,
        }
    }

    #[test]
    fn routes_below_the_base_path() {
        let service = relay_service("/relay/");
        assert_eq!(service.route("/relay/getBlob"), Some("getBlob"));
        assert_eq!(service.route("/relay/"), Some(""));
        assert_eq!(service.route("/relay"), Some(""));
        assert_eq!(service.route("/relayed"), None);
        assert_eq!(service.route("/getBlob"), None);

        let root = relay_service("/");
        assert_eq!(root.route("/status"), Some("status"));
        assert_eq!(root.route("/"), Some(""));
    }

    #[test]
    fn reads_query_params() {
        let uri: Uri = "/relay/getBlob?key=a%20b&other=1".parse().unwrap();
        assert_eq!(query_param(&uri, "key").as_deref(), Some("a b"));
        assert_eq!(query_param(&uri, "missing"), None);

        let uri: Uri = "/relay/getBlob?key=".parse().unwrap();
        assert_eq!(query_param(&uri, "key"), None);
        let uri: Uri = "/relay/getBlob".parse().unwrap();
        assert_eq!(query_param(&uri, "key"), None);
    }

    #[test]
    fn falls_back_to_x_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-content-type", HeaderValue::from_static("text/plain"));
        headers.insert("x-content-length", HeaderValue::from_static("12"));
        headers.insert("content-length", HeaderValue::from_static(""));
        assert_eq!(
            first_header(&headers, "content-type", "x-content-type").as_deref(),
            Some("text/plain")
        );
        assert_eq!(
            first_header(&headers, "content-length", "x-content-length").as_deref(),
            Some("12")
        );

        headers.insert("content-type", HeaderValue::from_static("image/png"));
        assert_eq!(
            first_header(&headers, "content-type", "x-content-type").as_deref(),
            Some("image/png")
        );
    }

    #[test]
    fn each_upload_error_has_one_status() {
        let id = RequestId::from("r1");
        assert_eq!(
            upload_status(&UploadError::MissingHeaders),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            upload_status(&UploadError::UnknownRequest(id.clone())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(upload_status(&UploadError::Cancelled(id)), StatusCode::GONE);
        assert_eq!(
            upload_status(&UploadError::Incomplete {
                expected: 5,
                received: 3
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let response = upload_failed(UploadError::ReceiverGone);
        assert_eq!(response.headers()[CONNECTION], "close");
        let response = upload_failed(UploadError::MissingHeaders);
        assert!(response.headers().get(CONNECTION).is_none());
    }
}

// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::Response;
pub use hyper::StatusCode;

/// Type-erased response body.
///
/// Streamed bodies are rarely `Sync`, so this doesn't require it.
pub type GenericBody = UnsyncBoxBody<Bytes, anyhow::Error>;

/// Type-erased HTTP response
pub type GenericResponse = Response<GenericBody>;

/// Return an empty 200 response.
///
/// Because this is expected to be used with CORS preflight requests, it returns a 200 response
/// instead of 204 for compatibility with Firefox.
pub fn empty() -> GenericResponse {
    Response::new(empty_body())
}

pub fn empty_body() -> GenericBody {
    Empty::new().map_err(anyhow::Error::from).boxed_unsync()
}

/// Return a [`GenericResponse`] with known content.
pub fn full(
    status: StatusCode,
    content_type: &'static str,
    content: impl ToString,
) -> GenericResponse {
    let body = content.to_string().map_err(anyhow::Error::from).boxed_unsync();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(body)
        .unwrap()
}

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    full(status, "text/plain; charset=utf-8", content)
}

/// Return a JSON response with known content.
pub fn json(status: StatusCode, content: impl ToString) -> GenericResponse {
    full(status, "application/json", content)
}

/// Return a plain text "404 not found" response with appropriate status code
pub fn not_found() -> GenericResponse {
    text(StatusCode::NOT_FOUND, "404 not found")
}

/// Return a 405 listing the `allowed` methods.
pub fn method_not_allowed(allowed: &'static str) -> GenericResponse {
    let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "405 method not allowed");
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static(allowed));
    response
}

/// Return a response whose body is produced by `chunks` as they become available.
///
/// If the stream fails partway, the connection is cut, so clients can tell a truncated body
/// from a complete one.
pub fn stream<S, E>(
    status: StatusCode,
    content_type: &str,
    content_length: Option<u64>,
    chunks: S,
) -> GenericResponse
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<anyhow::Error>,
{
    let frames = chunks
        .map_ok(Frame::data)
        .map_err(|err| -> anyhow::Error { err.into() });
    let body = StreamBody::new(frames);
    let content_type = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let mut response = Response::new(BodyExt::boxed_unsync(body));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    if let Some(length) = content_length {
        response.headers_mut().insert(CONTENT_LENGTH, length.into());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_body(response: GenericResponse) -> Vec<u8> {
        let body = response.into_body().collect();
        futures::executor::block_on(body)
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[test]
    fn sanity_check_full_response() {
        let response = full(
            StatusCode::CREATED,
            "foo/bar",
            format_args!("double = {}, square = {}", 123 + 123, 123 * 123),
        );
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "foo/bar");
        assert_eq!(to_body(response), b"double = 246, square = 15129");
    }

    #[test]
    fn sanity_check_json_response() {
        let response = json(StatusCode::OK, r#"{"connections": 2}"#);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(to_body(response), br#"{"connections": 2}"#);
    }

    #[test]
    fn streamed_responses_concatenate_chunks() {
        let chunks = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"AB")),
            Ok(Bytes::from_static(b"CD")),
        ]);
        let response = stream(StatusCode::OK, "image/png", Some(4), chunks);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "image/png");
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "4");
        assert_eq!(to_body(response), b"ABCD");
    }

    #[test]
    fn streamed_responses_fail_with_their_source() {
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"AB")),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")),
        ]);
        let response = stream(StatusCode::OK, "not a\nheader", None, chunks);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        let body = response.into_body().collect();
        assert!(futures::executor::block_on(body).is_err());
    }

    #[test]
    fn method_not_allowed_lists_allowed_methods() {
        let response = method_not_allowed("GET, HEAD");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET, HEAD");
    }
}

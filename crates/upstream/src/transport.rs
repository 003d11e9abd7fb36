//! reqwest-backed [`HttpTransport`].
//!
//! One POST per call: status check, then JSON or SSE decoding of the body.
//! Redirects are never followed so the bearer token stays on the target host.

use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource as _};
use futures_util::StreamExt as _;
use idgate_types::{HttpTransport, UpstreamError, UpstreamRequest, UpstreamResponse};
use reqwest::{Client, Response, header::CONTENT_TYPE, redirect::Policy};
use serde_json::Value;
use std::{error::Error as _, time::Duration};

/// Sends upstream requests with a shared [`reqwest::Client`].
#[derive(Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    /// Wraps an existing client. The client should not follow redirects;
    /// see [`build_client`].
    #[must_use]
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

/// Build the HTTP client used for both credential and upstream traffic.
///
/// # Errors
///
/// Returns [`UpstreamError::Network`] if the TLS backend fails to initialise.
pub fn build_client() -> Result<Client, UpstreamError> {
    Client::builder()
        .redirect(Policy::none())
        .user_agent(concat!("idgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| UpstreamError::Network(format!("failed to build HTTP client: {e}")))
}

/// Flatten a reqwest error and its sources into one line.
fn describe(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    msg
}

fn map_error(e: &reqwest::Error, timeout: Duration) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(format!("no response within {}ms", timeout.as_millis()))
    } else {
        UpstreamError::Network(describe(e))
    }
}

fn is_event_stream(resp: &Response) -> bool {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

fn is_response(value: &Value) -> bool {
    value.get("result").is_some() || value.get("error").is_some()
}

/// Decode a 2xx JSON body. A blank body decodes to `null`.
///
/// # Errors
///
/// Returns [`UpstreamError::Parse`] if the body is neither blank nor JSON.
pub fn decode_body(body: &[u8]) -> Result<Value, UpstreamError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| UpstreamError::Parse(e.to_string()))
}

/// Read an SSE body up to the first event carrying `result` or `error`.
///
/// The server may keep the stream open after answering, so reading stops at
/// that event. Otherwise the first JSON event is used once the stream ends,
/// and a stream with no events at all decodes to `null`.
async fn read_event_stream(resp: Response, timeout: Duration) -> Result<Value, UpstreamError> {
    let mut events = resp.bytes_stream().eventsource();
    let mut first_json = None;
    let mut seen = 0usize;

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| match e {
            EventStreamError::Transport(e) => map_error(&e, timeout),
            other => UpstreamError::Parse(format!("malformed event stream: {other}")),
        })?;
        seen += 1;
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            tracing::debug!(event = %event.event, "skipping non-JSON event");
            continue;
        };
        if is_response(&value) {
            tracing::debug!(events = seen, "response event received");
            return Ok(value);
        }
        first_json.get_or_insert(value);
    }

    match first_json {
        Some(value) => Ok(value),
        None if seen == 0 => Ok(Value::Null),
        None => Err(UpstreamError::Parse(
            "event stream contained no JSON message".into(),
        )),
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let UpstreamRequest {
            url,
            headers,
            body,
            timeout,
        } = request;

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_error(&e, timeout))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        tracing::debug!(status = status.as_u16(), "upstream responded");

        if !status.is_success() {
            let bytes = resp.bytes().await.map_err(|e| map_error(&e, timeout))?;
            return Err(UpstreamError::HttpStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let data = if is_event_stream(&resp) {
            read_event_stream(resp, timeout).await?
        } else {
            let bytes = resp.bytes().await.map_err(|e| map_error(&e, timeout))?;
            decode_body(&bytes)?
        };
        Ok(UpstreamResponse {
            status: status.as_u16(),
            headers,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        body::Body,
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Redirect},
        routing::post,
    };
    use futures_util::{StreamExt as _, stream};
    use http::HeaderValue;
    use serde_json::json;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/mcp")
    }

    fn request(url: &str, body: Value) -> UpstreamRequest {
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        UpstreamRequest {
            url: url.to_string(),
            headers,
            body,
            timeout: Duration::from_secs(5),
        }
    }

    fn transport() -> ReqwestTransport {
        ReqwestTransport::new(build_client().unwrap())
    }

    #[tokio::test]
    async fn test_json_response() {
        let app = Router::new().route(
            "/mcp",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["authorization"], "Bearer tok");
                (
                    [("mcp-session-id", "s-1")],
                    Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": {}})),
                )
            }),
        );
        let url = serve(app).await;
        let resp = transport()
            .post(request(&url, json!({"jsonrpc": "2.0", "id": 7, "method": "ping"})))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.data["id"], 7);
        assert_eq!(resp.headers["Mcp-Session-Id"], "s-1");
    }

    #[tokio::test]
    async fn test_sse_response() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"x\":1}}\n\n",
                )
            }),
        );
        let url = serve(app).await;
        let resp = transport().post(request(&url, json!({}))).await.unwrap();
        assert_eq!(resp.data["result"]["x"], 1);
    }

    #[tokio::test]
    async fn test_error_status_keeps_body() {
        let app = Router::new().route(
            "/mcp",
            post(|| async { (StatusCode::NOT_FOUND, "session not found") }),
        );
        let url = serve(app).await;
        let err = transport().post(request(&url, json!({}))).await.unwrap_err();
        assert_eq!(
            err,
            UpstreamError::HttpStatus {
                status: 404,
                body: "session not found".into()
            }
        );
    }

    #[tokio::test]
    async fn test_accepted_without_body() {
        let app = Router::new().route("/mcp", post(|| async { StatusCode::ACCEPTED }));
        let url = serve(app).await;
        let resp = transport().post(request(&url, json!({}))).await.unwrap();
        assert_eq!(resp.status, 202);
        assert_eq!(resp.data, Value::Null);
    }

    #[tokio::test]
    async fn test_unparseable_body() {
        let app = Router::new().route("/mcp", post(|| async { "<html>oops</html>" }));
        let url = serve(app).await;
        let err = transport().post(request(&url, json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[tokio::test]
    async fn test_timeout() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let url = serve(app).await;
        let mut req = request(&url, json!({}));
        req.timeout = Duration::from_millis(100);
        let err = transport().post(req).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("100ms"));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = transport()
            .post(request(&format!("http://{addr}/mcp"), json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "network");
    }

    #[tokio::test]
    async fn test_redirects_not_followed() {
        let app = Router::new().route(
            "/mcp",
            post(|| async { Redirect::temporary("https://elsewhere.example.com/").into_response() }),
        );
        let url = serve(app).await;
        let err = transport().post(request(&url, json!({}))).await.unwrap_err();
        assert_eq!(err.status(), Some(307));
    }

    fn sse_route(body: &'static str) -> Router {
        Router::new().route(
            "/mcp",
            post(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }),
        )
    }

    #[tokio::test]
    async fn test_sse_skips_progress_notifications() {
        let url = serve(sse_route(concat!(
            ": keepalive\r\n\r\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n",
        )))
        .await;
        let resp = transport().post(request(&url, json!({}))).await.unwrap();
        assert_eq!(resp.data, json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}));
    }

    #[tokio::test]
    async fn test_sse_joins_multiline_data() {
        let url = serve(sse_route(
            "data: {\"jsonrpc\":\"2.0\",\"id\":2,\ndata: \"result\":[]}\n\n",
        ))
        .await;
        let resp = transport().post(request(&url, json!({}))).await.unwrap();
        assert_eq!(resp.data["id"], 2);
    }

    #[tokio::test]
    async fn test_sse_falls_back_to_first_json_event() {
        let url = serve(sse_route(
            "data: not json\n\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n\n",
        ))
        .await;
        let resp = transport().post(request(&url, json!({}))).await.unwrap();
        assert_eq!(resp.data, json!({"jsonrpc": "2.0", "method": "x"}));
    }

    #[tokio::test]
    async fn test_sse_without_json_is_parse_error() {
        let url = serve(sse_route("data: {broken\n\n")).await;
        let err = transport().post(request(&url, json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[tokio::test]
    async fn test_sse_stream_left_open_after_response() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                let first = stream::once(async {
                    Ok::<_, std::convert::Infallible>(
                        "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n",
                    )
                });
                let body = Body::from_stream(first.chain(stream::pending()));
                ([(header::CONTENT_TYPE, "text/event-stream")], body)
            }),
        );
        let url = serve(app).await;
        let mut req = request(&url, json!({}));
        req.timeout = Duration::from_secs(30);
        let resp = tokio::time::timeout(Duration::from_secs(2), transport().post(req))
            .await
            .expect("response event should end the read")
            .unwrap();
        assert_eq!(resp.data, json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
    }

    #[test]
    fn test_decode_body_variants() {
        assert_eq!(decode_body(b"").unwrap(), Value::Null);
        assert_eq!(decode_body(b"  \n").unwrap(), Value::Null);
        assert_eq!(decode_body(br#"{"a":1}"#).unwrap(), json!({"a": 1}));
        assert!(decode_body(b"data: nope\n\n").is_err());
    }
}

//! Request and notification forwarding.
//!
//! Every call follows the same path: build headers, attach the session id,
//! resolve a token, POST once, then update the session and validate the
//! reply. Failures at any step become a JSON-RPC error response; nothing is
//! retried.

use crate::{
    context::ProxyContext,
    error::{from_unexpected, translate},
    session::SESSION_HEADER,
};
use futures_util::FutureExt as _;
use http::{
    HeaderMap, HeaderValue,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
};
use idgate_types::{
    AuthError, IdToken, Message, Notification, ProxyError, Request, RequestId, Response,
    ShapeError, UpstreamError, UpstreamRequest, UpstreamResponse, jsonrpc::JSONRPC_VERSION,
};
use serde_json::Value;
use std::{any::Any, panic::AssertUnwindSafe};
use tokio_util::sync::CancellationToken;

const ACCEPT_VALUE: &str = "application/json, text/event-stream";
const CANCELLED: &str = "request cancelled by client";

impl ProxyContext {
    /// Forward `request` and return the upstream response, or an error
    /// response carrying the same id. Never fails.
    pub async fn handle_request(&self, request: &Request) -> Response {
        self.handle_request_cancellable(request, &CancellationToken::new())
            .await
    }

    /// [`Self::handle_request`], abandoning the call once `cancel` fires.
    pub async fn handle_request_cancellable(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Response {
        let id = request.id.clone();
        let outcome = AssertUnwindSafe(self.exchange(request, cancel))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(method = %request.method, id = %id, error = %e, "request failed");
                Response::failure(id, translate(&e))
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                tracing::error!(method = %request.method, id = %id, panic = %detail, "request handler panicked");
                Response::failure(id, from_unexpected(&detail))
            }
        }
    }

    /// Forward `notification`. Failures are logged and swallowed; the
    /// notification itself is always handed back.
    pub async fn handle_notification(&self, notification: Notification) -> Notification {
        self.handle_notification_cancellable(notification, &CancellationToken::new())
            .await
    }

    /// [`Self::handle_notification`] with cancellation.
    pub async fn handle_notification_cancellable(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> Notification {
        let body = match serde_json::to_value(&notification) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(method = %notification.method, error = %e, "cannot encode notification");
                return notification;
            }
        };
        let outcome = AssertUnwindSafe(self.forward(&body, false, cancel))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(_)) => {
                tracing::debug!(method = %notification.method, "notification forwarded");
            }
            Ok(Err(e)) => {
                tracing::warn!(method = %notification.method, error = %e, "notification not delivered");
            }
            Err(panic) => {
                tracing::warn!(
                    method = %notification.method,
                    panic = %panic_message(panic.as_ref()),
                    "notification handler panicked"
                );
            }
        }
        notification
    }

    /// Dispatch any message: requests get their response back, notifications
    /// come back unchanged, everything else passes through untouched.
    pub async fn handle_message(&self, message: Message) -> Message {
        self.handle_message_cancellable(message, &CancellationToken::new())
            .await
    }

    /// [`Self::handle_message`] with cancellation.
    pub async fn handle_message_cancellable(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Message {
        match message {
            Message::Request(request) => {
                Message::Response(self.handle_request_cancellable(&request, cancel).await)
            }
            Message::Notification(notification) => Message::Notification(
                self.handle_notification_cancellable(notification, cancel)
                    .await,
            ),
            other => other,
        }
    }

    async fn exchange(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Response, ProxyError> {
        tracing::debug!(method = %request.method, id = %request.id, "forwarding request");
        let body = serde_json::to_value(request)?;
        let upstream = self.forward(&body, request.is_handshake(), cancel).await?;
        Ok(validate_response(upstream.data, &request.id)?)
    }

    /// One authenticated POST; owns all session bookkeeping.
    async fn forward(
        &self,
        body: &Value,
        handshake: bool,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse, ProxyError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        if let Some(session) = self.session.get() {
            match HeaderValue::from_str(&session) {
                Ok(value) => {
                    headers.insert(SESSION_HEADER, value);
                }
                Err(_) => tracing::warn!("session id is not a valid header value; omitting it"),
            }
        }

        let token = self.token(cancel).await?;
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token.value()))
            .map_err(|_| AuthError::InvalidToken("identity token is not a valid header value".into()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let outbound = UpstreamRequest {
            url: self.target_url.clone(),
            headers,
            body: body.clone(),
            timeout: self.timeout,
        };
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(UpstreamError::Timeout(CANCELLED.into())),
            result = self.transport.post(outbound) => result,
        };

        match result {
            Ok(response) => {
                if handshake
                    && let Some(session) = response
                        .headers
                        .get(SESSION_HEADER)
                        .and_then(|v| v.to_str().ok())
                {
                    tracing::info!(session, "session established");
                    self.session.set(session);
                }
                Ok(response)
            }
            Err(e) => {
                if e.is_session_gone() {
                    self.session.clear();
                }
                Err(e.into())
            }
        }
    }

    /// Token for the target, bounded by the request timeout and `cancel`.
    async fn token(&self, cancel: &CancellationToken) -> Result<IdToken, ProxyError> {
        let fetch = tokio::time::timeout(self.timeout, self.tokens.get_token(&self.target_url));
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(UpstreamError::Timeout(CANCELLED.into()).into()),
            result = fetch => match result {
                Ok(token) => Ok(token?),
                Err(_) => Err(AuthError::TokenFetchFailed(format!(
                    "no identity token within {}ms",
                    self.timeout.as_millis()
                ))
                .into()),
            },
        }
    }
}

/// Check that `payload` is a JSON-RPC 2.0 response to `expected`. The
/// returned [`Response`] serializes back to `payload` unchanged.
///
/// # Errors
///
/// Returns a [`ShapeError`] carrying `payload` unchanged when the version is
/// missing or wrong, the id differs, or the body does not hold exactly one
/// of a `result` or a well-formed `error`.
pub fn validate_response(payload: Value, expected: &RequestId) -> Result<Response, ShapeError> {
    let reason = envelope_problem(&payload, expected);
    if let Some(reason) = reason {
        return Err(ShapeError::new(reason, payload));
    }
    match Response::from_raw(payload.clone()) {
        Ok(response) => Ok(response),
        Err(e) => Err(ShapeError::new(e.to_string(), payload)),
    }
}

fn envelope_problem(payload: &Value, expected: &RequestId) -> Option<String> {
    let Some(obj) = payload.as_object() else {
        return Some("response is not a JSON object".into());
    };
    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Some("missing or unsupported jsonrpc version".into());
    }
    match obj.get("id").and_then(RequestId::from_value) {
        Some(ref id) if id == expected => {}
        Some(id) => return Some(format!("response id {id} does not match request id {expected}")),
        None => return Some("missing or invalid response id".into()),
    }
    match (obj.get("result"), obj.get("error")) {
        (Some(_), None) => None,
        (None, Some(error)) => {
            let code_ok = error
                .get("code")
                .and_then(Value::as_i64)
                .is_some_and(|c| i32::try_from(c).is_ok());
            let message_ok = error.get("message").is_some_and(Value::is_string);
            (!(code_ok && message_ok)).then(|| "malformed error object".into())
        }
        (Some(_), Some(_)) => Some("response has both result and error".into()),
        (None, None) => Some("response has neither result nor error".into()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, TARGET, echo, harness, harness_with, ok_response};
    use idgate_types::{UpstreamResponse, jsonrpc::codes};
    use serde_json::json;
    use std::{sync::atomic::Ordering, time::Duration};

    fn req(id: i64, method: &str) -> Request {
        Request::new(RequestId::Number(id), method, None)
    }

    fn with_session(mut resp: UpstreamResponse, session: &str) -> UpstreamResponse {
        let name = http::HeaderName::from_bytes(b"Mcp-Session-Id").unwrap();
        resp.headers.insert(name, HeaderValue::from_str(session).unwrap());
        resp
    }

    fn status(code: u16) -> impl Fn(&UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        move |_| {
            Err(UpstreamError::HttpStatus {
                status: code,
                body: format!("status {code}"),
            })
        }
    }

    #[tokio::test]
    async fn test_pass_through_fidelity() {
        let h = harness(FakeTransport::new(|r| Ok(ok_response(r, json!({"tools": []})))));
        let resp = h.ctx.handle_request(&req(7, "tools/list")).await;
        assert_eq!(
            resp.to_value(),
            json!({"jsonrpc": "2.0", "id": 7, "result": {"tools": []}})
        );
    }

    #[tokio::test]
    async fn test_upstream_error_object_passed_through() {
        let h = harness(FakeTransport::new(|r| {
            Ok(UpstreamResponse {
                status: 200,
                headers: HeaderMap::new(),
                data: json!({
                    "jsonrpc": "2.0",
                    "id": r.body["id"],
                    "error": {"code": -32000, "message": "tool exploded", "data": {"x": 1}},
                }),
            })
        }));
        let resp = h.ctx.handle_request(&req(3, "tools/call")).await;
        let err = resp.error().unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "tool exploded");
        assert_eq!(err.data, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_upstream_body_returned_byte_for_byte() {
        let upstream = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32000, "message": "m", "data": null, "hint": "retry later"},
            "_meta": {"server": "s-1"},
        });
        let body = upstream.clone();
        let h = harness(FakeTransport::new(move |_| {
            Ok(UpstreamResponse {
                status: 200,
                headers: HeaderMap::new(),
                data: body.clone(),
            })
        }));
        let resp = h.ctx.handle_request(&req(3, "tools/call")).await;
        assert_eq!(resp.to_value(), upstream);
        let line = serde_json::to_string(&resp).unwrap();
        assert!(line.contains(r#""data":null"#));
        assert!(line.contains(r#""_meta""#));
    }

    #[tokio::test]
    async fn test_outbound_headers() {
        let h = harness(FakeTransport::new(echo));
        h.ctx.handle_request(&req(1, "ping")).await;
        let call = h.transport.call(0);
        assert_eq!(call.url, TARGET);
        assert_eq!(call.headers[CONTENT_TYPE], "application/json");
        assert_eq!(call.headers[ACCEPT], ACCEPT_VALUE);
        let auth = &call.headers[AUTHORIZATION];
        assert!(auth.to_str().unwrap().starts_with("Bearer "));
        assert!(auth.is_sensitive());
        assert!(call.headers.get(SESSION_HEADER).is_none());
        assert_eq!(call.body["method"], "ping");
        assert_eq!(call.timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_token_reused_across_requests() {
        let h = harness(FakeTransport::new(echo));
        h.ctx.handle_request(&req(1, "ping")).await;
        h.ctx.handle_request(&req(2, "ping")).await;
        assert_eq!(h.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.transport.call(0).headers[AUTHORIZATION],
            h.transport.call(1).headers[AUTHORIZATION]
        );
    }

    #[tokio::test]
    async fn test_session_propagation() {
        let h = harness(FakeTransport::new(|r| {
            let resp = ok_response(r, json!({"protocolVersion": "2025-03-26"}));
            if r.body["method"] == "initialize" {
                Ok(with_session(resp, "abc"))
            } else {
                Ok(resp)
            }
        }));
        h.ctx.handle_request(&req(1, "initialize")).await;
        assert_eq!(h.ctx.session().get().as_deref(), Some("abc"));

        h.ctx.handle_request(&req(2, "tools/list")).await;
        assert_eq!(h.transport.call(1).headers[SESSION_HEADER], "abc");
    }

    #[tokio::test]
    async fn test_only_handshake_sets_session() {
        let h = harness(FakeTransport::new(|r| Ok(with_session(ok_response(r, json!({})), "other"))));
        h.ctx.handle_request(&req(1, "tools/list")).await;
        assert_eq!(h.ctx.session().get(), None);
    }

    #[tokio::test]
    async fn test_handshake_without_header_keeps_session() {
        let h = harness(FakeTransport::new(echo));
        h.ctx.session().set("existing");
        h.ctx.handle_request(&req(1, "initialize")).await;
        assert_eq!(h.ctx.session().get().as_deref(), Some("existing"));
    }

    #[tokio::test]
    async fn test_session_invalidated_on_404() {
        let h = harness(FakeTransport::new(status(404)));
        h.ctx.session().set("abc");
        let resp = h.ctx.handle_request(&req(4, "tools/list")).await;
        assert_eq!(h.ctx.session().get(), None);
        let err = resp.error().unwrap();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        assert_eq!(resp.id, RequestId::Number(4));
    }

    #[tokio::test]
    async fn test_other_errors_keep_session() {
        let h = harness(FakeTransport::new(status(500)));
        h.ctx.session().set("abc");
        h.ctx.handle_request(&req(1, "tools/list")).await;
        assert_eq!(h.ctx.session().get().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_error_code_table() {
        for (code, expected) in [(401, -32002), (403, -32002), (404, -32601), (422, -32602), (502, -32603)] {
            let h = harness(FakeTransport::new(status(code)));
            let resp = h.ctx.handle_request(&req(1, "tools/call")).await;
            let err = resp.error().unwrap();
            assert_eq!(err.code, expected, "status {code}");
            assert!(err.message.starts_with("HTTP error: "));
            assert_eq!(err.data.as_ref().unwrap()["status"], code);
        }
    }

    #[tokio::test]
    async fn test_auth_short_circuit() {
        let h = harness_with(FakeTransport::new(echo), true);
        let resp = h.ctx.handle_request(&req(9, "tools/list")).await;
        assert_eq!(h.transport.call_count(), 0);
        let err = resp.error().unwrap();
        assert_eq!(err.code, -32603);
        assert!(err.message.starts_with("Authentication failed: "));
        assert!(!err.data.as_ref().unwrap().to_string().contains("Bearer"));
    }

    #[tokio::test]
    async fn test_invalid_response_shape() {
        for bad in [
            json!({"id": 1, "result": {}}),
            json!({"jsonrpc": "2.0", "id": 2, "result": {}}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "id": 1, "result": 1, "error": {"code": 1, "message": "x"}}),
            json!({"jsonrpc": "2.0", "id": 1, "error": {"message": "no code"}}),
            json!("not an object"),
            Value::Null,
        ] {
            let payload = bad.clone();
            let h = harness(FakeTransport::new(move |_| {
                Ok(UpstreamResponse {
                    status: 200,
                    headers: HeaderMap::new(),
                    data: payload.clone(),
                })
            }));
            let resp = h.ctx.handle_request(&req(1, "tools/list")).await;
            let err = resp.error().unwrap();
            assert_eq!(err.message, "Invalid response format from target server", "{bad}");
            assert_eq!(err.data.as_ref().unwrap()["payload"], bad);
        }
    }

    #[test]
    fn test_string_ids_must_match_exactly() {
        let expected = RequestId::String("1".into());
        let payload = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        assert!(validate_response(payload, &expected).is_err());
        let payload = json!({"jsonrpc": "2.0", "id": "1", "result": null});
        assert_eq!(
            validate_response(payload, &expected).unwrap().result(),
            Some(&Value::Null)
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let h = harness(FakeTransport::new(|_| panic!("transport bug")));
        let resp = h.ctx.handle_request(&req(5, "tools/list")).await;
        let err = resp.error().unwrap();
        assert_eq!(err.code, -32603);
        assert_eq!(err.message, "Internal error: transport bug");
    }

    #[tokio::test]
    async fn test_cancellation_resolves_as_timeout() {
        let h = harness(FakeTransport::new(echo).slow_requests(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let resp = h.ctx.handle_request_cancellable(&req(6, "tools/call"), &cancel).await;
        let err = resp.error().unwrap();
        assert_eq!(err.code, -32603);
        assert!(err.message.starts_with("Request timeout: "));
    }

    #[tokio::test]
    async fn test_notification_resilience() {
        let h = harness(FakeTransport::new(|_| Err(UpstreamError::Network("connection reset".into()))));
        let n = Notification::new("notifications/cancelled", Some(json!({"requestId": 1})));
        let out = h.ctx.handle_message(Message::Notification(n.clone())).await;
        assert_eq!(out, Message::Notification(n));
        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_notification_survives_auth_failure_and_panic() {
        let h = harness_with(FakeTransport::new(echo), true);
        let n = Notification::new("notifications/initialized", None);
        assert_eq!(h.ctx.handle_notification(n.clone()).await, n);
        assert_eq!(h.transport.call_count(), 0);

        let h = harness(FakeTransport::new(|_| panic!("boom")));
        assert_eq!(h.ctx.handle_notification(n.clone()).await, n);
    }

    #[tokio::test]
    async fn test_notification_404_clears_session() {
        let h = harness(FakeTransport::new(status(404)));
        h.ctx.session().set("abc");
        h.ctx
            .handle_notification(Notification::new("notifications/initialized", None))
            .await;
        assert_eq!(h.ctx.session().get(), None);
    }

    #[tokio::test]
    async fn test_other_messages_untouched() {
        let h = harness(FakeTransport::new(echo));
        let other = Message::Other(json!({"hello": "world"}));
        assert_eq!(h.ctx.handle_message(other.clone()).await, other);
        let response = Message::Response(Response::success(RequestId::Number(1), json!({})));
        assert_eq!(h.ctx.handle_message(response.clone()).await, response);
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_request_message_dispatch() {
        let h = harness(FakeTransport::new(echo));
        let out = h
            .ctx
            .handle_message(Message::Request(req(11, "tools/list")))
            .await;
        let Message::Response(resp) = out else {
            panic!("expected a response");
        };
        assert_eq!(resp.id, RequestId::Number(11));
        assert_eq!(resp.result(), Some(&json!({})));
    }
}

//! Fakes for the credential and transport seams.

use crate::ProxyContext;
use async_trait::async_trait;
use base64::Engine as _;
use idgate_auth::TokenManager;
use idgate_types::{
    AuthError, CredentialProvider, HttpTransport, IdTokenClient, UpstreamError, UpstreamRequest,
    UpstreamResponse, token::unix_now,
};
use serde_json::{Value, json};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub(crate) const TARGET: &str = "https://mcp-abc123.a.run.app/mcp";

/// A JWT-shaped token expiring `secs` from now.
pub(crate) fn jwt(secs: u64, n: usize) -> String {
    let enc = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let payload = json!({ "exp": unix_now() + secs, "n": n });
    format!(
        "{}.{}.sig",
        enc.encode(br#"{"alg":"RS256"}"#),
        enc.encode(payload.to_string())
    )
}

pub(crate) struct FakeCredentials {
    pub fail: bool,
    pub fetches: Arc<AtomicUsize>,
}

struct FakeClient {
    fail: bool,
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn client_for(&self, _audience: &str) -> Result<Box<dyn IdTokenClient>, AuthError> {
        Ok(Box::new(FakeClient {
            fail: self.fail,
            fetches: Arc::clone(&self.fetches),
        }))
    }
}

#[async_trait]
impl IdTokenClient for FakeClient {
    async fn fetch_id_token(&self) -> Result<String, AuthError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(AuthError::TokenFetchFailed("metadata server unreachable".into()));
        }
        Ok(jwt(3600, n))
    }

    fn source(&self) -> &'static str {
        "fake"
    }
}

type Responder =
    Box<dyn Fn(&UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> + Send + Sync>;

/// Transport answering from a closure and recording every request.
pub(crate) struct FakeTransport {
    responder: Responder,
    delay: Duration,
    pub calls: Mutex<Vec<UpstreamRequest>>,
}

impl FakeTransport {
    pub(crate) fn new(
        responder: impl Fn(&UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Delay calls that carry an `id`; notifications stay instant.
    pub(crate) fn slow_requests(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn call(&self, i: usize) -> UpstreamRequest {
        self.calls.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn post(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        self.calls.lock().unwrap().push(request.clone());
        if request.body.get("id").is_some() && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(&request)
    }
}

/// A 200 response echoing the request id with `result`.
pub(crate) fn ok_response(request: &UpstreamRequest, result: Value) -> UpstreamResponse {
    UpstreamResponse {
        status: 200,
        headers: http::HeaderMap::new(),
        data: json!({ "jsonrpc": "2.0", "id": request.body["id"], "result": result }),
    }
}

/// Echo server: every call succeeds with an empty result.
pub(crate) fn echo(request: &UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
    Ok(ok_response(request, json!({})))
}

pub(crate) struct Harness {
    pub ctx: Arc<ProxyContext>,
    pub transport: Arc<FakeTransport>,
    pub fetches: Arc<AtomicUsize>,
}

pub(crate) fn harness(transport: FakeTransport) -> Harness {
    harness_with(transport, false)
}

pub(crate) fn harness_with(transport: FakeTransport, auth_fails: bool) -> Harness {
    let fetches = Arc::new(AtomicUsize::new(0));
    let credentials = FakeCredentials {
        fail: auth_fails,
        fetches: Arc::clone(&fetches),
    };
    let tokens = Arc::new(TokenManager::new(Arc::new(credentials)));
    let transport = Arc::new(transport);
    let ctx = Arc::new(ProxyContext::new(
        TARGET,
        Duration::from_secs(5),
        tokens,
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
    ));
    Harness {
        ctx,
        transport,
        fetches,
    }
}

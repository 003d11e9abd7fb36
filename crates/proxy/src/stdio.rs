//! Newline-delimited JSON-RPC over stdin/stdout.
//!
//! The read loop parses and classifies each line, then hands requests and
//! notifications to their own tasks. A single writer task owns the output so
//! concurrent responses never interleave. Only protocol messages are written;
//! diagnostics belong on stderr.

use crate::context::ProxyContext;
use idgate_types::{Message, ProtocolError, RequestId, Response, jsonrpc::codes};
use serde_json::Value;
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _},
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

/// Lines longer than this are discarded unparsed.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("message exceeds {max_bytes} bytes")]
    MessageTooLarge { max_bytes: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Cancellation handles for requests still being served, keyed by id.
///
/// A reused id replaces the older entry; each entry carries a generation so a
/// finishing task only removes its own.
#[derive(Default)]
struct InFlight {
    next_generation: u64,
    requests: HashMap<RequestId, (u64, CancellationToken)>,
}

impl InFlight {
    fn register(&mut self, id: RequestId) -> (u64, CancellationToken) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let cancel = CancellationToken::new();
        if self
            .requests
            .insert(id.clone(), (generation, cancel.clone()))
            .is_some()
        {
            tracing::warn!(id = %id, "request id reused while still in flight");
        }
        (generation, cancel)
    }

    fn finish(&mut self, id: &RequestId, generation: u64) {
        if self.requests.get(id).is_some_and(|(g, _)| *g == generation) {
            self.requests.remove(id);
        }
    }

    fn cancel(&self, id: &RequestId) -> bool {
        match self.requests.get(id) {
            Some((_, cancel)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }
}

type SharedInFlight = Arc<Mutex<InFlight>>;

/// Serve `ctx` over a line-oriented reader/writer pair until EOF or
/// `shutdown`, then wait for in-flight work and flush.
///
/// # Errors
///
/// Returns the first I/O error from reading input or writing output.
pub async fn run_stdio<R, W>(
    ctx: Arc<ProxyContext>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve(ctx, reader, writer, shutdown, MAX_LINE_BYTES).await
}

async fn serve<R, W>(
    ctx: Arc<ProxyContext>,
    mut reader: R,
    writer: W,
    shutdown: CancellationToken,
    max_line_bytes: usize,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let in_flight: SharedInFlight = Arc::default();
    let mut tasks = JoinSet::new();
    let mut read_error = None;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::info!("shutdown requested; no longer reading input");
                break;
            }
            read = bounded_read_line(&mut reader, &mut buf, max_line_bytes) => read,
        };
        while tasks.try_join_next().is_some() {}

        match read {
            Ok(0) => {
                tracing::debug!("input closed");
                break;
            }
            Ok(_) => {}
            Err(FramingError::MessageTooLarge { max_bytes }) => {
                tracing::warn!(max_bytes, "discarding oversized input line");
                continue;
            }
            Err(FramingError::Io(e)) => {
                tracing::error!(error = %e, "failed to read input");
                read_error = Some(e);
                break;
            }
        }

        let line = buf.trim_ascii();
        if line.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_slice(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable input line");
                let error = ProtocolError::new(codes::PARSE_ERROR, format!("Parse error: {e}"));
                send(&tx, Response::failure(RequestId::Null, error).to_value());
                continue;
            }
        };
        if value.is_array() {
            let error = ProtocolError::new(
                codes::INVALID_REQUEST,
                "Invalid Request: batch messages are not supported",
            );
            send(&tx, Response::failure(RequestId::Null, error).to_value());
            continue;
        }

        match Message::classify(value) {
            Message::Request(request) => {
                let (generation, cancel) = lock(&in_flight).register(request.id.clone());
                let ctx = Arc::clone(&ctx);
                let in_flight = Arc::clone(&in_flight);
                let tx = tx.clone();
                tasks.spawn(async move {
                    let response = ctx.handle_request_cancellable(&request, &cancel).await;
                    lock(&in_flight).finish(&request.id, generation);
                    send(&tx, response.to_value());
                });
            }
            Message::Notification(notification) => {
                if let Some(id) = notification.cancelled_request_id()
                    && lock(&in_flight).cancel(&id)
                {
                    tracing::debug!(id = %id, "client cancelled request");
                }
                let ctx = Arc::clone(&ctx);
                tasks.spawn(async move {
                    ctx.handle_notification(notification).await;
                });
            }
            Message::Other(value) if value.get("method").is_some() && value.get("id").is_some() => {
                let id = value
                    .get("id")
                    .and_then(RequestId::from_value)
                    .unwrap_or(RequestId::Null);
                tracing::warn!(id = %id, "rejecting malformed request");
                let error = ProtocolError::new(codes::INVALID_REQUEST, "Invalid Request");
                send(&tx, Response::failure(id, error).to_value());
            }
            other => {
                tracing::debug!(kind = other.kind(), "ignoring message from client");
            }
        }
    }

    drain(&mut tasks).await;
    drop(tx);
    let write_result = match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e)),
    };
    match read_error {
        Some(e) => Err(e),
        None => write_result,
    }
}

fn lock(in_flight: &SharedInFlight) -> std::sync::MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send(tx: &mpsc::UnboundedSender<Value>, value: Value) {
    if tx.send(value).is_err() {
        tracing::warn!("output closed; dropping message");
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    if !tasks.is_empty() {
        tracing::debug!(pending = tasks.len(), "waiting for in-flight messages");
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "message task failed");
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Value>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(value) = rx.recv().await {
        let mut line = serde_json::to_vec(&value)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

/// Read one line into `buf` without buffering more than `max_bytes`.
///
/// Returns the number of bytes read, `0` at EOF. An oversized line is
/// consumed through its newline and reported as
/// [`FramingError::MessageTooLarge`].
///
/// # Errors
///
/// Returns [`FramingError::Io`] if the reader fails.
pub async fn bounded_read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<usize, FramingError> {
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }

        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            let take = pos + 1;
            if total + take > max_bytes {
                reader.consume(take);
                return Err(FramingError::MessageTooLarge { max_bytes });
            }
            buf.extend_from_slice(&available[..take]);
            reader.consume(take);
            return Ok(total + take);
        }

        let len = available.len();
        if total + len > max_bytes {
            reader.consume(len);
            drain_until_newline(reader).await;
            return Err(FramingError::MessageTooLarge { max_bytes });
        }
        buf.extend_from_slice(available);
        total += len;
        reader.consume(len);
    }
}

async fn drain_until_newline<R: AsyncBufRead + Unpin>(reader: &mut R) {
    let drain = async {
        loop {
            match reader.fill_buf().await {
                Ok([]) => return,
                Ok(buf) => {
                    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        reader.consume(pos + 1);
                        return;
                    }
                    let len = buf.len();
                    reader.consume(len);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "I/O error while skipping oversized line");
                    return;
                }
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("gave up skipping oversized line after {DRAIN_TIMEOUT:?}");
    }
}

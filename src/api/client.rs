//! Command pipeline.
//!
//! Requests to `/cs` are JSON arrays of command objects; responses align
//! positionally, or collapse to a single negative integer when the server
//! rejects the whole batch. The pipeline coalesces submissions into
//! batches behind a single driver task:
//!
//! - a batch window opens 350 ms after the first enqueue and drains the
//!   queue when it fires, or earlier once 50 entries are waiting;
//! - requests flagged immediate (login, hashcash resubmission) bypass the
//!   queue so authentication ordering holds;
//! - at most one batch is in flight; enqueues during a flight open the
//!   next window;
//! - batch-level negative responses retry with jittered exponential
//!   backoff, per-slot negatives complete that slot without retry;
//! - an `X-Hashcash` challenge pauses the batch, solves the proof of work
//!   off-thread, and resubmits with the solution header.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, warn};

use crate::api::error::ApiErrorCode;
use crate::api::hashcash::HashcashChallenge;
use crate::config::RetryConfig;
use crate::error::{MegaError, Result};
use crate::http::HttpClient;

/// Time the queue waits for more entries after the first enqueue.
pub const BATCH_WINDOW: Duration = Duration::from_millis(350);
/// Queue length that flushes without waiting for the window.
pub const MAX_BATCH: usize = 50;

const MAX_HASHCASH_ROUNDS: u32 = 3;

/// Transport abstraction so the pipeline can be exercised without a
/// network; [`HttpClient`] is the production implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON body, returning the response text and any `X-Hashcash`
    /// challenge header.
    async fn post_json(
        &self,
        url: &str,
        body: String,
        hashcash_token: Option<&str>,
    ) -> Result<(String, Option<String>)>;
}

#[async_trait]
impl Transport for HttpClient {
    async fn post_json(
        &self,
        url: &str,
        body: String,
        hashcash_token: Option<&str>,
    ) -> Result<(String, Option<String>)> {
        HttpClient::post_json(self, url, body, hashcash_token).await
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Skip the batch queue and dispatch directly.
    pub immediate: bool,
}

struct Envelope {
    body: Value,
    reply: oneshot::Sender<Result<Value>>,
}

enum Command {
    Request { envelope: Envelope, immediate: bool },
    SetSid(Option<String>),
}

/// Handle to the command pipeline. Cloning shares the driver task;
/// dropping every handle shuts it down.
#[derive(Clone)]
pub struct ApiClient {
    tx: mpsc::Sender<Command>,
}

impl ApiClient {
    /// Spawn the pipeline driver over the given transport.
    pub fn new(transport: Arc<dyn Transport>, gateway: String, retry: RetryConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let driver = Driver {
            transport,
            gateway,
            retry,
            seq_id: rand::random::<u32>() as u64,
            sid: None,
            rx,
        };
        tokio::spawn(driver.run());
        Self { tx }
    }

    /// Submit a command through the batch queue.
    pub async fn request(&self, body: Value) -> Result<Value> {
        self.request_with(body, RequestOptions::default()).await
    }

    /// Submit a command that bypasses the queue.
    pub async fn request_immediate(&self, body: Value) -> Result<Value> {
        self.request_with(body, RequestOptions { immediate: true }).await
    }

    /// Submit a command with explicit options.
    pub async fn request_with(&self, body: Value, options: RequestOptions) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Request {
                envelope: Envelope { body, reply },
                immediate: options.immediate,
            })
            .await
            .map_err(|_| MegaError::Protocol("command pipeline stopped".to_string()))?;
        rx.await
            .map_err(|_| MegaError::Protocol("command pipeline stopped".to_string()))?
    }

    /// Install or clear the session id appended to every call.
    pub async fn set_session_id(&self, sid: Option<String>) {
        let _ = self.tx.send(Command::SetSid(sid)).await;
    }
}

struct Driver {
    transport: Arc<dyn Transport>,
    gateway: String,
    retry: RetryConfig,
    seq_id: u64,
    sid: Option<String>,
    rx: mpsc::Receiver<Command>,
}

impl Driver {
    async fn run(mut self) {
        let mut queue: Vec<Envelope> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let command = if let Some(when) = deadline {
                tokio::select! {
                    cmd = self.rx.recv() => match cmd {
                        Some(cmd) => Some(cmd),
                        None => break,
                    },
                    _ = sleep_until(when) => None,
                }
            } else {
                match self.rx.recv().await {
                    Some(cmd) => Some(cmd),
                    None => break,
                }
            };

            match command {
                Some(Command::SetSid(sid)) => self.sid = sid,
                Some(Command::Request { envelope, immediate }) if immediate => {
                    self.dispatch(vec![envelope]).await;
                }
                Some(Command::Request { envelope, .. }) => {
                    queue.push(envelope);
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + BATCH_WINDOW);
                    }
                    if queue.len() >= MAX_BATCH {
                        self.dispatch(std::mem::take(&mut queue)).await;
                        deadline = None;
                    }
                }
                None => {
                    // Window expired.
                    self.dispatch(std::mem::take(&mut queue)).await;
                    deadline = None;
                }
            }
        }

        if !queue.is_empty() {
            self.dispatch(queue).await;
        }
    }

    fn batch_url(&mut self) -> String {
        self.seq_id = self.seq_id.wrapping_add(1);
        match &self.sid {
            Some(sid) => format!("{}cs?id={}&sid={}", self.gateway, self.seq_id, sid),
            None => format!("{}cs?id={}", self.gateway, self.seq_id),
        }
    }

    async fn dispatch(&mut self, entries: Vec<Envelope>) {
        if entries.is_empty() {
            return;
        }

        let url = self.batch_url();
        let bodies: Vec<&Value> = entries.iter().map(|e| &e.body).collect();
        let body = serde_json::to_string(&bodies).expect("command array serializes");
        debug!(batch = entries.len(), %url, "dispatching batch");

        let mut hashcash_token: Option<String> = None;
        let mut hashcash_rounds = 0u32;
        let mut attempt = 0u32;

        let results: Vec<Result<Value>> = loop {
            let response = self
                .transport
                .post_json(&url, body.clone(), hashcash_token.as_deref())
                .await;

            match response {
                Ok((_, Some(challenge))) => {
                    if hashcash_rounds >= MAX_HASHCASH_ROUNDS {
                        break fail_all(&entries, || {
                            MegaError::Protocol("hashcash challenge loop".to_string())
                        });
                    }
                    hashcash_rounds += 1;
                    debug!("solving hashcash challenge");

                    let solved = tokio::task::spawn_blocking(move || {
                        HashcashChallenge::parse(&challenge)?.solve()
                    })
                    .await;
                    match solved {
                        Ok(Ok(token)) => {
                            hashcash_token = Some(token);
                            continue;
                        }
                        Ok(Err(err)) => {
                            let message = err.to_string();
                            break fail_all(&entries, || MegaError::Protocol(message.clone()));
                        }
                        Err(_) => {
                            break fail_all(&entries, || {
                                MegaError::Protocol("hashcash solver panicked".to_string())
                            });
                        }
                    }
                }
                Ok((text, None)) => match map_batch_response(&text, entries.len()) {
                    BatchOutcome::Complete(results) => break results,
                    BatchOutcome::RetryAll(code) => {
                        if attempt >= self.retry.max_retries {
                            break entries.iter().map(|_| Err(code.into_error())).collect();
                        }
                        let delay = jittered(self.retry.delay_for(attempt));
                        warn!(?code, attempt, ?delay, "batch rejected, backing off");
                        attempt += 1;
                        sleep(delay).await;
                        continue;
                    }
                    BatchOutcome::Malformed(message) => {
                        break fail_all(&entries, || MegaError::Protocol(message.clone()));
                    }
                },
                Err(err) => {
                    if err.is_transient() && attempt < self.retry.max_retries {
                        let delay = jittered(self.retry.delay_for(attempt));
                        warn!(error = %err, attempt, ?delay, "transport error, backing off");
                        attempt += 1;
                        sleep(delay).await;
                        continue;
                    }
                    let message = err.to_string();
                    break fail_all(&entries, || MegaError::Transient(message.clone()));
                }
            }
        };

        for (envelope, result) in entries.into_iter().zip(results) {
            let _ = envelope.reply.send(result);
        }
    }
}

fn fail_all(entries: &[Envelope], make: impl Fn() -> MegaError) -> Vec<Result<Value>> {
    entries.iter().map(|_| Err(make())).collect()
}

fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + rand::random::<f64>() * 0.25;
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

enum BatchOutcome {
    /// Positional results, one per request.
    Complete(Vec<Result<Value>>),
    /// Whole batch rejected with a retryable code.
    RetryAll(ApiErrorCode),
    /// Response shape not understood.
    Malformed(String),
}

/// Map the raw `/cs` response text onto per-slot outcomes.
fn map_batch_response(text: &str, expected: usize) -> BatchOutcome {
    let value: Value = match serde_json::from_str(text.trim()) {
        Ok(v) => v,
        Err(_) => return BatchOutcome::Malformed(format!("unparseable response: {text:.80}")),
    };

    // A bare negative integer rejects every slot at once.
    if let Some(code) = value.as_i64().filter(|c| *c < 0) {
        let code = ApiErrorCode::from(code);
        return if code.is_retryable() {
            BatchOutcome::RetryAll(code)
        } else {
            BatchOutcome::Complete((0..expected).map(|_| Err(code.into_error())).collect())
        };
    }

    let Some(items) = value.as_array() else {
        return BatchOutcome::Malformed("response is neither array nor error code".to_string());
    };
    if items.len() != expected {
        return BatchOutcome::Malformed(format!(
            "expected {expected} results, got {}",
            items.len()
        ));
    }

    let results = items
        .iter()
        .map(|item| match item.as_i64().filter(|c| *c < 0) {
            Some(code) => Err(ApiErrorCode::from(code).into_error()),
            None => Ok(item.clone()),
        })
        .collect();
    BatchOutcome::Complete(results)
}


#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;
    use serde_json::json;

    fn client(transport: Arc<MockTransport>) -> ApiClient {
        ApiClient::new(
            transport,
            "https://g.api.mega.test/".to_string(),
            RetryConfig {
                base_delay: Duration::from_millis(10),
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_concurrent_requests_into_one_batch() {
        let transport = MockTransport::scripted(vec![MockTransport::ok(r#"[{"a":1},{"b":2}]"#)]);
        let api = client(transport.clone());

        let (r1, r2) = tokio::join!(
            api.request(json!({"a": "ug"})),
            api.request(json!({"a": "f"})),
        );

        assert_eq!(r1.unwrap(), json!({"a": 1}));
        assert_eq!(r2.unwrap(), json!({"b": 2}));
        assert_eq!(transport.call_count(), 1);

        let (url, bodies, _) = transport.call(0);
        assert_eq!(bodies, vec![json!({"a": "ug"}), json!({"a": "f"})]);
        assert!(url.starts_with("https://g.api.mega.test/cs?id="));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_requests_bypass_the_window() {
        let transport = MockTransport::scripted(vec![MockTransport::ok("[0]")]);
        let api = client(transport.clone());

        let result = api.request_immediate(json!({"a": "us"})).await.unwrap();
        assert_eq!(result, json!(0));
        assert_eq!(transport.call_count(), 1);
        assert_eq!(transport.call(0).1, vec![json!({"a": "us"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_flushes_without_timer() {
        let expected: Vec<Value> = (0..MAX_BATCH).map(|i| json!(i)).collect();
        let transport = MockTransport::scripted(vec![MockTransport::ok(
            &serde_json::to_string(&expected).unwrap(),
        )]);
        let api = client(transport.clone());

        let futures: Vec<_> = (0..MAX_BATCH)
            .map(|i| api.request(json!({"a": "t", "i": i})))
            .collect();
        let results = futures::future::join_all(futures).await;

        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(i));
        }
        assert_eq!(transport.call_count(), 1);
        assert_eq!(transport.call(0).1.len(), MAX_BATCH);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_level_eagain_retries_then_succeeds() {
        let transport = MockTransport::scripted(vec![
            MockTransport::ok("-3"),
            MockTransport::ok("-3"),
            MockTransport::ok("[7]"),
        ]);
        let api = client(transport.clone());

        let result = api.request(json!({"a": "ug"})).await.unwrap();
        assert_eq!(result, json!(7));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_batch_error_fails_every_slot() {
        let transport = MockTransport::scripted(vec![MockTransport::ok("-15")]);
        let api = client(transport.clone());

        let (r1, r2) = tokio::join!(
            api.request(json!({"a": "f"})),
            api.request(json!({"a": "ug"})),
        );

        assert!(matches!(r1, Err(MegaError::Auth(_))));
        assert!(matches!(r2, Err(MegaError::Auth(_))));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_slot_errors_do_not_retry() {
        let transport = MockTransport::scripted(vec![MockTransport::ok(r#"[-9,{"ok":1}]"#)]);
        let api = client(transport.clone());

        let (r1, r2) = tokio::join!(
            api.request(json!({"a": "g", "n": "missing"})),
            api.request(json!({"a": "ug"})),
        );

        assert!(matches!(r1, Err(MegaError::NotFound(_))));
        assert_eq!(r2.unwrap(), json!({"ok": 1}));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_surfaces_transient() {
        let retries = RetryConfig::default().max_retries as usize;
        let transport = MockTransport::scripted(
            (0..=retries).map(|_| MockTransport::ok("-3")).collect(),
        );
        let api = client(transport.clone());

        let result = api.request(json!({"a": "f"})).await;
        assert!(matches!(result, Err(MegaError::Transient(_))));
        assert_eq!(transport.call_count(), retries + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_result_count_is_a_protocol_error() {
        let transport = MockTransport::scripted(vec![MockTransport::ok("[1,2,3]")]);
        let api = client(transport.clone());

        let result = api.request(json!({"a": "f"})).await;
        assert!(matches!(result, Err(MegaError::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_ids_increase_per_batch() {
        let transport = MockTransport::scripted(vec![
            MockTransport::ok("[1]"),
            MockTransport::ok("[2]"),
        ]);
        let api = client(transport.clone());

        api.request(json!({"a": "x"})).await.unwrap();
        api.request(json!({"a": "y"})).await.unwrap();

        let id = |url: &str| -> u64 {
            url.split("id=").nth(1).unwrap().parse().unwrap()
        };
        let (url1, _, _) = transport.call(0);
        let (url2, _, _) = transport.call(1);
        assert_eq!(id(&url2), id(&url1).wrapping_add(1));
    }

    #[tokio::test(start_paused = true)]
    async fn session_id_lands_in_the_query() {
        let transport = MockTransport::scripted(vec![MockTransport::ok("[1]")]);
        let api = client(transport.clone());

        api.set_session_id(Some("SID123".to_string())).await;
        api.request(json!({"a": "f"})).await.unwrap();

        assert!(transport.call(0).0.ends_with("&sid=SID123"));
    }

    #[tokio::test]
    async fn hashcash_challenge_pauses_and_resubmits() {
        // Real time: the solver hashes a 12 MiB buffer.
        let token = crate::base64::base64url_encode(&[0x5A; 48]);
        let transport = MockTransport::scripted(vec![
            Ok(("".to_string(), Some(format!("1:255:x:{token}")))),
            MockTransport::ok("[0]"),
        ]);
        let api = client(transport.clone());

        let result = api.request_immediate(json!({"a": "us"})).await.unwrap();
        assert_eq!(result, json!(0));
        assert_eq!(transport.call_count(), 2);

        let (_, _, solution) = transport.call(1);
        let solution = solution.expect("second call carries the solution");
        assert!(solution.starts_with(&format!("1:{token}:")));
    }
}

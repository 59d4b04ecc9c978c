//! Delivers `ApplyRollbackPayload`s to a predicate's `then_that` sink.
//!
//! One bounded mpsc queue per predicate gives strict per-predicate FIFO
//! ordering with unbounded concurrency *across* predicates (§4.4/§5): each
//! queue is drained by its own worker task, so a slow sink for predicate A
//! never blocks predicate B's delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, warn};

use crate::config::DispatchConfig;
use crate::error::EngineError;
use crate::metrics;
use crate::predicates::store::PredicateStore;
use crate::predicates::types::{ActionSpec, Predicate, PredicateStatus};
use crate::types::ApplyRollbackPayload;

struct Job {
    predicate: Predicate,
    payload: ApplyRollbackPayload,
}

/// Outcome of a failed delivery attempt. A 4xx is the sink telling us the
/// request itself was wrong (bad URL, bad auth, malformed body) - logging
/// and counting it is enough, the predicate keeps its queue and tries the
/// next payload. Exhausting retries against 5xx/transport failures means
/// the sink is unreachable, which is worker-fatal: the predicate is
/// `Interrupted` and its queue torn down (§7 "after exhaustion... becomes
/// Interrupted", contrasted with the 4xx case).
enum DeliveryError {
    Rejected(String),
    Fatal(String),
}

/// Shared across the engine; cheap to clone (all state behind `Arc`).
#[derive(Clone)]
pub struct DispatchHandle {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<PredicateStore>,
    config: DispatchConfig,
    http: reqwest::Client,
    queues: RwLock<HashMap<String, mpsc::Sender<Job>>>,
}

impl DispatchHandle {
    pub fn new(store: Arc<PredicateStore>, config: DispatchConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .expect("reqwest client build");
        Self {
            inner: Arc::new(Inner { store, config, http, queues: RwLock::new(HashMap::new()) }),
        }
    }

    /// Enqueues a payload for delivery. On overflow, the predicate is
    /// marked `Interrupted` and the payload is dropped per §4.4's
    /// backpressure contract (data integrity over liveness).
    pub async fn enqueue(&self, predicate: Predicate, payload: ApplyRollbackPayload) -> Result<(), EngineError> {
        let sender = self.sender_for(&predicate).await;
        match sender.try_send(Job { predicate: predicate.clone(), payload }) {
            Ok(()) => {
                metrics::set_dispatch_queue_depth(&predicate.uuid, sender.max_capacity() as i64 - sender.capacity() as i64);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(uuid = %predicate.uuid, "dispatch queue overflow, interrupting predicate");
                self.inner
                    .queues
                    .write()
                    .await
                    .remove(&predicate.uuid);
                self.inner
                    .store
                    .set_status(
                        &predicate.uuid,
                        &PredicateStatus::Interrupted { reason: "dispatch queue overflow".to_string() },
                    )
                    .await?;
                Err(EngineError::dispatch("per-predicate queue overflow"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(EngineError::dispatch("dispatch worker for predicate has shut down"))
            }
        }
    }

    /// Stops the predicate's worker and drops its queue (best effort -
    /// in-flight jobs are abandoned, matching §5's "drains... best effort").
    pub async fn deregister(&self, uuid: &str) {
        self.inner.queues.write().await.remove(uuid);
    }

    async fn sender_for(&self, predicate: &Predicate) -> mpsc::Sender<Job> {
        if let Some(sender) = self.inner.queues.read().await.get(&predicate.uuid) {
            return sender.clone();
        }
        let mut queues = self.inner.queues.write().await;
        if let Some(sender) = queues.get(&predicate.uuid) {
            return sender.clone();
        }
        let (tx, rx) = mpsc::channel(self.inner.config.per_predicate_queue_depth);
        let inner = self.inner.clone();
        tokio::spawn(worker_loop(inner, rx));
        queues.insert(predicate.uuid.clone(), tx.clone());
        tx
    }
}

async fn worker_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        let uuid = job.predicate.uuid.clone();
        match deliver(&inner, &job).await {
            Ok(()) => {
                metrics::set_dispatch_queue_depth(&uuid, rx.len() as i64);
            }
            Err(DeliveryError::Rejected(reason)) => {
                warn!(uuid = %uuid, %reason, "dispatch sink rejected payload, continuing queue");
                metrics::set_dispatch_queue_depth(&uuid, rx.len() as i64);
            }
            Err(DeliveryError::Fatal(reason)) => {
                error!(uuid = %uuid, %reason, "dispatch sink failed permanently");
                let _ = inner
                    .store
                    .set_status(&uuid, &PredicateStatus::Interrupted { reason })
                    .await;
                inner.queues.write().await.remove(&uuid);
                return;
            }
        }
    }
}

async fn deliver(inner: &Inner, job: &Job) -> Result<(), DeliveryError> {
    match &job.predicate.then_that {
        ActionSpec::Noop => Ok(()),
        ActionSpec::FileAppend { path } => deliver_file(path, &job.payload).await.map_err(DeliveryError::Fatal),
        ActionSpec::HttpPost { url, authorization_header } => {
            deliver_http(inner, url, authorization_header.as_deref(), &job.payload).await
        }
    }
}

async fn deliver_file(path: &str, payload: &ApplyRollbackPayload) -> Result<(), String> {
    let timer = metrics::Timer::new();
    let line = serde_json::to_string(payload).map_err(|e| e.to_string())?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| format!("opening {}: {}", path, e))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    file.write_all(b"\n").await.map_err(|e| e.to_string())?;
    file.flush().await.map_err(|e| e.to_string())?;
    metrics::record_dispatch_latency("file", timer.elapsed_secs());
    Ok(())
}

async fn deliver_http(
    inner: &Inner,
    url: &str,
    authorization_header: Option<&str>,
    payload: &ApplyRollbackPayload,
) -> Result<(), DeliveryError> {
    let body = serde_json::to_vec(payload).map_err(|e| DeliveryError::Fatal(e.to_string()))?;
    if body.len() > inner.config.body_size_limit_bytes {
        metrics::increment_dispatch_failures("http", "body_too_large");
        return Err(DeliveryError::Fatal(format!(
            "payload of {} bytes exceeds body_size_limit_bytes",
            body.len()
        )));
    }

    let max_retries = inner.config.max_retries;
    for attempt in 0..=max_retries {
        let timer = metrics::Timer::new();
        let mut request = inner.http.post(url).header("content-type", "application/json").body(body.clone());
        if let Some(auth) = authorization_header {
            request = request.header("authorization", auth);
        }

        match request.send().await {
            Ok(response) => {
                metrics::record_dispatch_latency("http", timer.elapsed_secs());
                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                if status.is_client_error() {
                    // User misconfiguration: logged, not retried, and not
                    // worker-fatal - a single bad response shouldn't tear
                    // down the predicate's whole dispatch queue.
                    metrics::increment_dispatch_failures("http", "4xx");
                    warn!(%url, %status, "dispatch rejected by sink (4xx), not retrying");
                    return Err(DeliveryError::Rejected(format!("sink returned {}", status)));
                }
                metrics::increment_dispatch_failures("http", "5xx");
            }
            Err(e) => {
                metrics::increment_dispatch_failures("http", "transport");
                warn!(%url, error = %e, attempt, "dispatch transport error");
            }
        }

        if attempt < max_retries {
            tokio::time::sleep(backoff_with_jitter(attempt)).await;
        }
    }
    Err(DeliveryError::Fatal(format!("exhausted {} retries against {}", max_retries, url)))
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 200u64.saturating_mul(1u64 << attempt.min(10));
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
    Duration::from_millis((base_ms + jitter_ms).min(30_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainhookInfo;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use rocksdb::{ColumnFamilyDescriptor, Options, DB};
    use tempfile::TempDir;

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let short = backoff_with_jitter(0);
        let long = backoff_with_jitter(8);
        assert!(short.as_millis() < long.as_millis());
        assert!(long.as_millis() <= 30_000);
    }

    fn test_inner(max_retries: u32) -> (Inner, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = vec![
            ColumnFamilyDescriptor::new("predicate_registry", Options::default()),
            ColumnFamilyDescriptor::new("predicate_status", Options::default()),
        ];
        let db = Arc::new(DB::open_cf_descriptors(&opts, dir.path(), cfs).unwrap());
        let inner = Inner {
            store: Arc::new(PredicateStore::new(db)),
            config: DispatchConfig { max_retries, ..Default::default() },
            http: reqwest::Client::new(),
            queues: RwLock::new(HashMap::new()),
        };
        (inner, dir)
    }

    fn empty_payload() -> ApplyRollbackPayload {
        ApplyRollbackPayload {
            apply: vec![],
            rollback: vec![],
            chainhook: ChainhookInfo { uuid: "test".to_string(), predicate: serde_json::Value::Null, is_streaming_blocks: true },
        }
    }

    #[tokio::test]
    async fn client_error_is_rejected_not_retried() {
        let app = Router::new().route("/hook", post(|| async { StatusCode::BAD_REQUEST }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        // max_retries is high enough that a Fatal path would hang this
        // test on repeated 5xx/transport backoff; Rejected must return on
        // the very first attempt regardless.
        let (inner, _dir) = test_inner(20);
        let url = format!("http://{}/hook", addr);
        let result = deliver_http(&inner, &url, None, &empty_payload()).await;
        assert!(matches!(result, Err(DeliveryError::Rejected(_))));
    }

    #[tokio::test]
    async fn server_error_exhausts_retries_as_fatal() {
        let app = Router::new().route("/hook", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let (inner, _dir) = test_inner(1);
        let url = format!("http://{}/hook", addr);
        let result = deliver_http(&inner, &url, None, &empty_payload()).await;
        assert!(matches!(result, Err(DeliveryError::Fatal(_))));
    }
}

//! Model lifecycle orchestration: drive a node to a desired loaded state.
//!
//! `ensure_loaded` is idempotent and survives the awkward cases a real node
//! produces: the model is already resident, the load request times out
//! client-side while the node keeps loading, or the model first needs a
//! confirmed download. Readiness is always established by polling the
//! loaded-model list, never assumed from the load response alone.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::time::Instant;

use crate::errors::LinkError;
use crate::model_id;
use crate::rpc::{DownloadProgress, DownloadStatus, LoadOutcome, ModelControl};

/// Coarse phase reported through the progress sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Load requested; waiting for the model to appear in the loaded list.
    Waiting,
    /// A weights download is in flight.
    Downloading,
    /// Model confirmed loaded.
    Ready,
}

/// One progress update during `ensure_loaded`.
#[derive(Debug, Clone)]
pub struct ModelLoadProgress {
    pub attempt: u32,
    pub status: LoadStatus,
    pub detail: Option<String>,
}

type ProgressSink = Box<dyn Fn(ModelLoadProgress) + Send + Sync>;

/// Default base interval between readiness polls; grows adaptively.
const DEFAULT_POLL_BASE: Duration = Duration::from_millis(500);

/// Floor for the load-request timeout carved out of the overall budget.
const REQUEST_TIMEOUT_FLOOR: Duration = Duration::from_secs(5);

/// Drives load and unload operations against one node.
pub struct ModelLifecycleManager<'a> {
    control: &'a dyn ModelControl,
    progress: Option<ProgressSink>,
    poll_base: Duration,
}

impl<'a> ModelLifecycleManager<'a> {
    pub fn new(control: &'a dyn ModelControl) -> Self {
        Self {
            control,
            progress: None,
            poll_base: DEFAULT_POLL_BASE,
        }
    }

    /// Register a sink for progress updates. Updates are best-effort and
    /// emitted from the polling task.
    pub fn with_progress(mut self, sink: impl Fn(ModelLoadProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(sink));
        self
    }

    /// Override the base interval between polls. The interval still grows
    /// adaptively from here and stays clamped to the remaining budget.
    pub fn with_poll_interval(mut self, base: Duration) -> Self {
        self.poll_base = base;
        self
    }

    fn emit(&self, attempt: u32, status: LoadStatus, detail: Option<String>) {
        if let Some(sink) = &self.progress {
            sink(ModelLoadProgress {
                attempt,
                status,
                detail,
            });
        }
    }

    /// Ensure `model_id` is loaded, returning the node's canonical id for
    /// it. `timeout` bounds the whole operation including any download.
    pub async fn ensure_loaded(
        &self,
        model_id: &str,
        timeout: Duration,
    ) -> Result<String, LinkError> {
        let start = Instant::now();

        // Already resident? Matching is fuzzy so "Org/Model-4bit" finds
        // "org model 4bit" and friends.
        let listed = (|| async { self.control.loaded_models().await })
            .retry(ExponentialBuilder::default().with_max_times(2))
            .when(LinkError::is_transport)
            .await?;
        if let Some(canonical) = model_id::find_match(&listed, model_id) {
            tracing::debug!(model = %canonical, "model_already_loaded");
            self.emit(0, LoadStatus::Ready, Some(canonical.to_string()));
            return Ok(canonical.to_string());
        }

        self.emit(0, LoadStatus::Waiting, None);
        tracing::info!(model = %model_id, timeout_ms = timeout.as_millis() as u64, "model_load_requested");

        // The load request gets a slice of the budget, not all of it. A node
        // busy loading often just doesn't answer; readiness polling below is
        // what actually decides the outcome.
        let request_timeout = timeout.min(REQUEST_TIMEOUT_FLOOR.max(timeout / 4));
        match tokio::time::timeout(request_timeout, self.control.load_model(model_id)).await {
            Ok(Ok(LoadOutcome::Loaded { model_id })) => {
                // Trust but verify: fall through to polling with the id the
                // node reported.
                tracing::debug!(model = %model_id, "load_acknowledged");
            }
            Ok(Ok(LoadOutcome::DownloadRequired {
                confirmation_token,
                message,
            })) => {
                tracing::info!(model = %model_id, detail = message.as_deref().unwrap_or(""), "download_confirmation_required");
                let download_id = self.control.confirm_load(&confirmation_token).await?;
                self.await_download(&download_id, start, timeout).await?;
            }
            Ok(Ok(LoadOutcome::Downloading { download_id })) => {
                self.await_download(&download_id, start, timeout).await?;
            }
            Ok(Err(e)) if e.is_transport() => {
                // Client-side failure; the node may still be loading.
                tracing::warn!(model = %model_id, error = %e, "load_request_transport_error");
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!(model = %model_id, "load_request_timed_out_client_side");
            }
        }

        self.poll_until_loaded(model_id, start, timeout).await
    }

    /// Ensure `model_id` is absent from the node. Unknown models count as
    /// already unloaded.
    pub async fn ensure_unloaded(
        &self,
        model_id: &str,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let start = Instant::now();

        let listed = self.control.loaded_models().await?;
        let Some(canonical) = model_id::find_match(&listed, model_id).map(|s| s.to_string())
        else {
            return Ok(());
        };

        tracing::info!(model = %canonical, "model_unload_requested");
        self.emit(0, LoadStatus::Waiting, Some(canonical.clone()));
        self.control.unload_model(&canonical).await?;

        let mut attempt: u32 = 0;
        loop {
            // Same tolerance as the load path: a node tearing a model down
            // can drop list requests.
            match self.control.loaded_models().await {
                Ok(listed) => {
                    if model_id::find_match(&listed, &canonical).is_none() {
                        tracing::info!(model = %canonical, "model_unloaded");
                        self.emit(attempt, LoadStatus::Ready, Some(canonical));
                        return Ok(());
                    }
                }
                Err(e) if e.is_transport() => {
                    tracing::debug!(error = %e, "unload_poll_transport_error");
                }
                Err(e) => return Err(e),
            }

            attempt += 1;
            self.emit(attempt, LoadStatus::Waiting, None);
            let delay = adaptive_poll_delay(attempt, self.poll_base, start.elapsed(), timeout);
            if delay.is_zero() {
                return Err(LinkError::LoadTimeout {
                    model_id: canonical,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Poll the download progress endpoint until the download finishes.
    /// A failed download is fatal; no readiness polling follows it.
    async fn await_download(
        &self,
        download_id: &str,
        start: Instant,
        budget: Duration,
    ) -> Result<(), LinkError> {
        let mut attempt: u32 = 0;
        loop {
            let progress = self.control.download_progress(download_id).await?;
            match progress.status {
                DownloadStatus::Completed => {
                    tracing::info!(download_id = %download_id, "model_download_complete");
                    return Ok(());
                }
                DownloadStatus::Failed => {
                    let reason = progress
                        .error
                        .unwrap_or_else(|| "download failed".to_string());
                    return Err(LinkError::DownloadFailed(reason));
                }
                DownloadStatus::Downloading => {
                    self.emit(
                        attempt,
                        LoadStatus::Downloading,
                        Some(format!("{:.0}%", progress.progress_percent)),
                    );
                }
            }

            attempt += 1;
            let delay = adaptive_poll_delay(attempt, self.poll_base, start.elapsed(), budget);
            if delay.is_zero() {
                return Err(LinkError::LoadTimeout {
                    model_id: download_id.to_string(),
                    timeout_ms: budget.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn poll_until_loaded(
        &self,
        model_id: &str,
        start: Instant,
        budget: Duration,
    ) -> Result<String, LinkError> {
        let mut attempt: u32 = 0;
        loop {
            // Listing errors here are transient by assumption; a node deep
            // in a load can drop requests.
            match self.control.loaded_models().await {
                Ok(listed) => {
                    if let Some(canonical) = model_id::find_match(&listed, model_id) {
                        tracing::info!(model = %canonical, elapsed_ms = start.elapsed().as_millis() as u64, "model_ready");
                        self.emit(attempt, LoadStatus::Ready, Some(canonical.to_string()));
                        return Ok(canonical.to_string());
                    }
                }
                Err(e) if e.is_transport() => {
                    tracing::debug!(error = %e, "readiness_poll_transport_error");
                }
                Err(e) => return Err(e),
            }

            attempt += 1;
            self.emit(attempt, LoadStatus::Waiting, None);
            let delay = adaptive_poll_delay(attempt, self.poll_base, start.elapsed(), budget);
            if delay.is_zero() {
                return Err(LinkError::LoadTimeout {
                    model_id: model_id.to_string(),
                    timeout_ms: budget.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
        }
    }
}

/// Next delay before poll `attempt` (1-based), given time already spent.
///
/// Grows the base interval by 1.5x per attempt, capped at 5s, then clamps
/// to the remaining budget so the final poll lands at the deadline rather
/// than overshooting it. Zero means the budget is exhausted.
pub fn adaptive_poll_delay(
    attempt: u32,
    base: Duration,
    elapsed: Duration,
    budget: Duration,
) -> Duration {
    let remaining = budget.saturating_sub(elapsed);
    if remaining.is_zero() {
        return Duration::ZERO;
    }

    let factor = 1.5f64.powi(attempt.saturating_sub(1).min(16) as i32);
    let raw = base.mul_f64(factor).min(Duration::from_secs(5));
    raw.min(remaining)
}

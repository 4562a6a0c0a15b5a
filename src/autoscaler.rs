//! Queue-depth driven concurrency recommendations.
//!
//! The scaler polls queue depth through a [`QueueDepthProvider`] and moves the
//! worker's concurrency one step at a time within `[min, max]`:
//!
//! ```text
//! depth > scale_up_threshold   && c < max  => c + 1
//! depth < scale_down_threshold && c > min  => c - 1
//! otherwise (including equality)           => no change
//! ```
//!
//! After a change no further change happens until the cooldown has elapsed.
//! Changes are applied through a [`ConcurrencyHandler`]; the scaler never
//! touches workers itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AutoScalerConfig;
use crate::lock::mutex_lock;

const SOURCE: &str = "autoscaler";

/// Reports the number of jobs waiting for a worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueDepthProvider: Send + Sync {
    async fn queue_depth(&self) -> anyhow::Result<usize>;
}

/// Applies a new concurrency level to the worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConcurrencyHandler: Send + Sync {
    async fn set_concurrency(&self, concurrency: usize) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDirection::Up => write!(f, "up"),
            ScaleDirection::Down => write!(f, "down"),
        }
    }
}

/// Emitted to listeners after a successful scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleEvent {
    pub direction: ScaleDirection,
    pub previous_concurrency: usize,
    pub new_concurrency: usize,
    pub queue_depth: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingStats {
    pub current_concurrency: usize,
    /// Depth seen by the last successful provider read, 0 before the first.
    pub queue_depth: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub scale_up_count: u64,
    pub scale_down_count: u64,
    pub last_scale_at: Option<DateTime<Utc>>,
    pub last_scale_event: Option<ScaleEvent>,
    pub is_running: bool,
}

/// Observer notified synchronously after each scale.
pub type ScaleListener = Arc<dyn Fn(&ScaleEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug)]
struct ScalerState {
    concurrency: usize,
    queue_depth: usize,
    last_scale_at: Option<Instant>,
    scale_up_count: u64,
    scale_down_count: u64,
    last_event: Option<ScaleEvent>,
}

pub struct AutoScaler {
    config: AutoScalerConfig,
    provider: Arc<dyn QueueDepthProvider>,
    handler: Arc<dyn ConcurrencyHandler>,
    state: Mutex<ScalerState>,
    listeners: Mutex<Vec<ScaleListener>>,
    /// Held for the duration of a poll so polls never overlap.
    poll_lock: tokio::sync::Mutex<()>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl AutoScaler {
    /// Creates a stopped scaler. Unusable settings are replaced as in
    /// [`AutoScalerConfig::validated`]; `initial_concurrency` is clamped into
    /// `[min_concurrency, max_concurrency]`.
    pub fn new(
        config: AutoScalerConfig,
        initial_concurrency: usize,
        provider: Arc<dyn QueueDepthProvider>,
        handler: Arc<dyn ConcurrencyHandler>,
    ) -> Self {
        let config = config.validated();
        let concurrency = initial_concurrency.clamp(config.min_concurrency, config.max_concurrency);
        if concurrency != initial_concurrency {
            warn!(
                requested = initial_concurrency,
                clamped = concurrency,
                "Initial concurrency outside configured bounds"
            );
        }
        Self {
            config,
            provider,
            handler,
            state: Mutex::new(ScalerState {
                concurrency,
                queue_depth: 0,
                last_scale_at: None,
                scale_up_count: 0,
                scale_down_count: 0,
                last_event: None,
            }),
            listeners: Mutex::new(Vec::new()),
            poll_lock: tokio::sync::Mutex::new(()),
            shutdown: Mutex::new(None),
        }
    }

    /// Registers a scale listener. A failing or panicking listener is logged
    /// and does not affect the others.
    pub fn on_scale<F>(&self, listener: F)
    where
        F: Fn(&ScaleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        mutex_lock(&self.listeners, SOURCE, "on_scale").push(Arc::new(listener));
    }

    /// Runs one scaling decision. Waits for any poll already in flight.
    ///
    /// Returns the event when concurrency changed.
    pub async fn poll(&self) -> Option<ScaleEvent> {
        let _guard = self.poll_lock.lock().await;
        self.poll_exclusive().await
    }

    async fn poll_exclusive(&self) -> Option<ScaleEvent> {
        let depth = match self.provider.queue_depth().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to read queue depth");
                return None;
            }
        };

        let current = {
            let mut state = mutex_lock(&self.state, SOURCE, "poll");
            state.queue_depth = depth;
            if let Some(last) = state.last_scale_at {
                if last.elapsed() < self.config.cooldown() {
                    debug!(queue_depth = depth, "Scaling in cooldown");
                    return None;
                }
            }
            state.concurrency
        };

        let (direction, target) = if depth > self.config.scale_up_threshold
            && current < self.config.max_concurrency
        {
            (ScaleDirection::Up, current + 1)
        } else if depth < self.config.scale_down_threshold && current > self.config.min_concurrency {
            (ScaleDirection::Down, current - 1)
        } else {
            return None;
        };

        if let Err(e) = self.handler.set_concurrency(target).await {
            warn!(
                error = %format!("{e:#}"),
                previous = current,
                target,
                "Concurrency handler rejected scale"
            );
            return None;
        }

        let event = ScaleEvent {
            direction,
            previous_concurrency: current,
            new_concurrency: target,
            queue_depth: depth,
            timestamp: Utc::now(),
        };
        {
            let mut state = mutex_lock(&self.state, SOURCE, "apply");
            state.concurrency = target;
            state.last_scale_at = Some(Instant::now());
            match direction {
                ScaleDirection::Up => state.scale_up_count += 1,
                ScaleDirection::Down => state.scale_down_count += 1,
            }
            state.last_event = Some(event.clone());
        }

        info!(
            %direction,
            previous = current,
            new = target,
            queue_depth = depth,
            "Scaled worker concurrency"
        );
        self.notify(&event);
        Some(event)
    }

    fn notify(&self, event: &ScaleEvent) {
        // Snapshot so listeners may register further listeners.
        let listeners = mutex_lock(&self.listeners, SOURCE, "notify").clone();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %format!("{e:#}"), "Scale listener failed"),
                Err(_) => warn!("Scale listener panicked"),
            }
        }
    }

    pub fn scaling_stats(&self) -> ScalingStats {
        let state = mutex_lock(&self.state, SOURCE, "stats");
        ScalingStats {
            current_concurrency: state.concurrency,
            queue_depth: state.queue_depth,
            min_concurrency: self.config.min_concurrency,
            max_concurrency: self.config.max_concurrency,
            scale_up_count: state.scale_up_count,
            scale_down_count: state.scale_down_count,
            last_scale_at: state.last_event.as_ref().map(|event| event.timestamp),
            last_scale_event: state.last_event.clone(),
            is_running: self.is_running(),
        }
    }

    /// Starts polling every `poll_interval`. A tick is skipped while another
    /// poll is still running. Calling `start` on a running scaler is a no-op.
    pub fn start(self: &Arc<Self>) {
        let token = {
            let mut shutdown = mutex_lock(&self.shutdown, SOURCE, "start");
            if shutdown.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return;
            }
            let token = CancellationToken::new();
            *shutdown = Some(token.clone());
            token
        };

        let scaler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scaler.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                poll_interval_ms = scaler.config.poll_interval_ms,
                "Autoscaler started"
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Ok(_guard) = scaler.poll_lock.try_lock() else {
                            debug!("Poll still in flight, skipping tick");
                            continue;
                        };
                        scaler.poll_exclusive().await;
                    }
                }
            }
            info!("Autoscaler stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(token) = mutex_lock(&self.shutdown, SOURCE, "stop").take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        mutex_lock(&self.shutdown, SOURCE, "is_running")
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}

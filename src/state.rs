use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::clock::{self, SharedClock};
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::metrics::Metrics;
use crate::pipeline::{Defenses, Pipelines};
use crate::sweep::{Sweepable, Sweeper};

/// The shared application state.
///
/// Everything a request can touch hangs off this struct: the loaded configuration,
/// the defense state and the pipelines assembled from it. It is cheap to clone and
/// is handed to route handlers through axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub defenses: Defenses,
    pub pipelines: Pipelines,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        Self::with_clock(config, clock::system())
    }

    /// Builds the state on top of an injected clock so expiry can be driven in tests.
    pub fn with_clock(config: AppConfig, clock: SharedClock) -> AppResult<Self> {
        let metrics = Metrics::new();
        let defenses = Defenses::from_config(&config, clock, metrics.clone())?;
        let pipelines = Pipelines::assemble(&defenses);
        Ok(Self { config: Arc::new(config), defenses, pipelines, metrics })
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.defenses.shutdown
    }

    /// Starts the two background sweepers. Both stop when the shutdown token fires.
    pub fn start_sweepers(&self) -> Sweepers {
        let shutdown = self.shutdown_token();
        let visitors = Metered {
            inner: self.defenses.visitor_sweep(),
            metrics: self.metrics.clone(),
            record: Metrics::add_visitors_evicted,
        };
        let tokens = Metered {
            inner: self.defenses.csrf.clone(),
            metrics: self.metrics.clone(),
            record: Metrics::add_tokens_evicted,
        };
        Sweepers {
            visitors: Sweeper::start(visitors, self.config.rate_limit.sweep_interval(), shutdown),
            tokens: Sweeper::start(tokens, self.config.csrf.sweep_interval(), shutdown),
        }
    }
}

/// Forwards a sweep and records the eviction count.
struct Metered<T> {
    inner: T,
    metrics: Metrics,
    record: fn(&Metrics, usize),
}

#[async_trait]
impl<T: Sweepable> Sweepable for Metered<T> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn sweep(&self) -> usize {
        let removed = self.inner.sweep().await;
        (self.record)(&self.metrics, removed);
        removed
    }
}

/// Handles to the running sweepers.
pub struct Sweepers {
    pub visitors: Sweeper,
    pub tokens: Sweeper,
}

impl Sweepers {
    pub async fn stop(self) {
        self.visitors.stop().await;
        self.tokens.stop().await;
    }
}

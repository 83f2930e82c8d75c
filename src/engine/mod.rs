//! Detection engine
//!
//! Assembles the detectors, aggregator, and alert manager from
//! configuration and runs the capture pipeline.

pub mod capture;
pub mod pipeline;

pub use self::capture::{create_source, CaptureConfig, CaptureMethod, FrameSource};
pub use self::pipeline::{run_pipeline, PipelineConfig};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregator::{Aggregator, ThreatScorer};
use crate::alerts::history::{spawn_writer, HistoryHandle};
use crate::alerts::notify::build_channels;
use crate::alerts::AlertManager;
use crate::bindings::{ArpBindingView, BindingTable};
use crate::config::Config;
use crate::patterns::matcher::PatternEngine;
use crate::patterns::store::{watch_database, SignatureStore};
use crate::patterns::SignatureSet;
use crate::rate::RateDetector;

/// Engine-level counters, shared across the pipeline threads and tasks
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Frames pulled from the capture source
    pub frames_captured: AtomicU64,
    /// Frames dropped at the bounded intake queue
    pub intake_dropped: AtomicU64,
    /// Frames rejected by the normalizer (non-ARP, truncated, malformed)
    pub frames_rejected: AtomicU64,
    /// Events dropped at a full detector queue
    pub detector_dropped: AtomicU64,
    /// Detection events produced
    pub events_detected: AtomicU64,
    /// Fused assessments handed to the alert manager
    pub assessments: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub intake_dropped: u64,
    pub frames_rejected: u64,
    pub detector_dropped: u64,
    pub events_detected: u64,
    pub assessments: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            intake_dropped: self.intake_dropped.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            detector_dropped: self.detector_dropped.load(Ordering::Relaxed),
            events_detected: self.events_detected.load(Ordering::Relaxed),
            assessments: self.assessments.load(Ordering::Relaxed),
        }
    }
}

/// Response posture. `Protect` enables active-response hooks on top of
/// observation; `Monitor` never acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Monitor,
    Protect,
}

/// Active-response seam, invoked per alert in protect mode. Responses run
/// outside the detection path and must not block it.
pub trait ResponseHook: Send + Sync {
    fn on_alert(&self, alert: &crate::alerts::Alert);
}

/// Default protect-mode hook: records what a response would target
pub struct LogResponse;

impl ResponseHook for LogResponse {
    fn on_alert(&self, alert: &crate::alerts::Alert) {
        if alert.severity >= crate::core::event::Severity::High {
            warn!(
                alert = %alert.id,
                severity = %alert.severity,
                source = %alert.source,
                "active response hook: would isolate source"
            );
        }
    }
}

/// Assembled detection engine
pub struct Engine {
    config: Config,
    mode: ResponseMode,
    table: Arc<BindingTable>,
    store: Arc<SignatureStore>,
    manager: AlertManager,
    stats: Arc<EngineStats>,
    history_task: Option<tokio::task::JoinHandle<()>>,
    /// Keeps the signature hot-reload watcher alive for the engine's life
    _watcher: Option<notify::RecommendedWatcher>,
    scorer: Option<Arc<dyn ThreatScorer>>,
    response: Arc<dyn ResponseHook>,
}

impl Engine {
    /// Build every component from configuration. Fatal when the
    /// configuration is invalid or a configured signature store is
    /// unusable.
    pub fn new(config: Config, mode: ResponseMode) -> Result<Self> {
        config.validate()?;

        let mut table = BindingTable::new(config.binding_config());
        for gateway in &config.network.trusted_gateways {
            table.add_trusted_gateway(gateway.ip, gateway.mac);
            info!(ip = %gateway.ip, pinned = gateway.mac.is_some(), "trusted gateway");
        }

        let (store, watcher) = match &config.detection.pattern_db_path {
            Some(path) => {
                let set: SignatureSet = crate::patterns::load_file(path)
                    .with_context(|| format!("unusable signature store: {}", path.display()))?;
                let store = Arc::new(SignatureStore::new(set));
                let watcher = match watch_database(path.clone(), store.clone()) {
                    Ok(watcher) => Some(watcher),
                    Err(err) => {
                        warn!(error = %err, "signature hot-reload unavailable");
                        None
                    }
                };
                (store, watcher)
            }
            None => {
                info!("no pattern database configured; signature matching idle");
                (Arc::new(SignatureStore::empty()), None)
            }
        };

        let (history, history_task) = spawn_history(&config);
        let channels = build_channels(&config.alerting.channels);
        info!(channels = channels.len(), "notification channels ready");
        let manager = AlertManager::new(config.manager_config(), channels, history);

        Ok(Self {
            config,
            mode,
            table: Arc::new(table),
            store,
            manager,
            stats: Arc::new(EngineStats::default()),
            history_task,
            _watcher: watcher,
            scorer: None,
            response: Arc::new(LogResponse),
        })
    }

    /// Attach an external threat scorer
    pub fn with_scorer(mut self, scorer: Arc<dyn ThreatScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Replace the protect-mode response hook
    pub fn with_response_hook(mut self, hook: Arc<dyn ResponseHook>) -> Self {
        self.response = hook;
        self
    }

    pub fn manager(&self) -> AlertManager {
        self.manager.clone()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    /// Read-only topology snapshot for dashboard collaborators
    pub fn bindings_snapshot(&self) -> Vec<ArpBindingView> {
        self.table.snapshot()
    }

    /// Run the pipeline until the source ends or shutdown is signalled
    pub async fn run(
        &mut self,
        source: Box<dyn FrameSource>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        let rate = RateDetector::new(
            self.config.rate_config(),
            self.config.detection.rate_thresholds.clone(),
        );
        let patterns = PatternEngine::new(self.store.clone(), self.config.detection.context_depth);
        let mut aggregator = Aggregator::new(std::time::Duration::from_secs(
            self.config.detection.correlation_window_seconds,
        ));
        if let Some(scorer) = &self.scorer {
            aggregator = aggregator.with_scorer(scorer.clone());
        }

        let pipeline_config = PipelineConfig {
            binding_max_age: std::time::Duration::from_secs(
                self.config.detection.binding_max_age_seconds,
            ),
            ..PipelineConfig::default()
        };

        // Protect mode: feed alerts to the response hook off the hot path
        let response_task = if self.mode == ResponseMode::Protect {
            let mut feed = self.manager.subscribe();
            let hook = self.response.clone();
            Some(tokio::spawn(async move {
                loop {
                    match feed.recv().await {
                        Ok(alert) => hook.on_alert(&alert),
                        // A lagged hook misses alerts rather than slowing
                        // the manager down
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }))
        } else {
            None
        };

        run_pipeline(
            pipeline_config,
            source,
            self.table.clone(),
            rate,
            patterns,
            aggregator,
            self.manager.clone(),
            self.stats.clone(),
            shutdown,
        )
        .await?;

        if let Some(task) = response_task {
            task.abort();
        }
        if let Some(task) = self.history_task.take() {
            // The manager still holds a history handle; just stop waiting
            task.abort();
        }

        let stats = self.stats.snapshot();
        info!(
            frames = stats.frames_captured,
            rejected = stats.frames_rejected,
            events = stats.events_detected,
            assessments = stats.assessments,
            "engine stopped"
        );
        Ok(())
    }
}

fn spawn_history(config: &Config) -> (HistoryHandle, Option<tokio::task::JoinHandle<()>>) {
    let path = config.alerting.history_path.clone();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "cannot create history directory");
            }
        }
    }
    let (handle, task) = spawn_writer(path);
    (handle, Some(task))
}

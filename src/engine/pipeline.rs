//! Capture pipeline
//!
//! Wires the capture thread, frame normalizer, the three detectors, the
//! aggregator, and the alert manager together:
//!
//! - the capture thread pushes raw frames into a bounded queue and never
//!   blocks: overflow is dropped and counted at the boundary
//! - the normalizer fans events out to one bounded queue per detector, so
//!   a slow detector sheds its own load instead of stalling ingestion
//! - per-interface event order is preserved on the way to each detector
//!   (single normalizer, FIFO queues)
//! - shutdown drains in flight work within a bounded grace period, after
//!   which remaining items are discarded and logged

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::capture::FrameSource;
use super::EngineStats;
use crate::aggregator::Aggregator;
use crate::alerts::AlertManager;
use crate::bindings::BindingTable;
use crate::core::arp::{ArpEvent, FrameNormalizer, RawFrame};
use crate::core::event::DetectionEvent;
use crate::patterns::matcher::PatternEngine;
use crate::rate::RateDetector;

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded capture → normalizer queue
    pub intake_queue: usize,
    /// Bounded normalizer → detector queues
    pub detector_queue: usize,
    /// Rate-detector tick (also the sub-bucket duration)
    pub tick_interval: Duration,
    /// Aggregator expiry sweep
    pub flush_interval: Duration,
    /// Binding-table aging sweep
    pub cleanup_interval: Duration,
    /// Bindings unseen this long are evicted
    pub binding_max_age: Duration,
    /// Grace period for draining on shutdown
    pub shutdown_grace: Duration,
    /// Context-buffer pair cap in the pattern engine
    pub max_context_pairs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            intake_queue: 4096,
            detector_queue: 2048,
            tick_interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
            binding_max_age: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(5),
            max_context_pairs: 4096,
        }
    }
}

/// Run the pipeline to completion: source exhausted or shutdown signalled,
/// then a bounded drain.
#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline(
    config: PipelineConfig,
    source: Box<dyn FrameSource>,
    table: Arc<BindingTable>,
    rate: RateDetector,
    patterns: PatternEngine,
    aggregator: Aggregator,
    manager: AlertManager,
    stats: Arc<EngineStats>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let (frame_tx, frame_rx) = crossbeam_channel::bounded::<RawFrame>(config.intake_queue);
    let (binding_tx, binding_rx) = mpsc::channel::<ArpEvent>(config.detector_queue);
    let (rate_tx, rate_rx) = mpsc::channel::<ArpEvent>(config.detector_queue);
    let (pattern_tx, pattern_rx) = mpsc::channel::<ArpEvent>(config.detector_queue);
    let (event_tx, event_rx) = mpsc::channel::<DetectionEvent>(config.detector_queue);

    // Capture thread: blocking reads, never blocked by consumers
    let capture_thread = spawn_capture(source, frame_tx, stats.clone(), shutdown.clone());

    // Normalizer thread: parse + fan out
    let normalizer_thread = spawn_normalizer(
        frame_rx,
        [binding_tx, rate_tx, pattern_tx],
        stats.clone(),
    );

    // Detector tasks
    let binding_task = tokio::spawn(binding_loop(
        binding_rx,
        table,
        event_tx.clone(),
        config.cleanup_interval,
        config.binding_max_age,
    ));
    let rate_task = tokio::spawn(rate_loop(
        rate_rx,
        rate,
        event_tx.clone(),
        config.tick_interval,
    ));
    let pattern_task = tokio::spawn(pattern_loop(
        pattern_rx,
        patterns,
        event_tx.clone(),
        config.max_context_pairs,
    ));
    drop(event_tx);

    // Aggregator task: fuse and submit
    let aggregator_task = tokio::spawn(aggregator_loop(
        event_rx,
        aggregator,
        manager,
        stats.clone(),
        config.flush_interval,
    ));

    // Everything downstream of capture ends by channel closure. Bound the
    // wait so a wedged detector cannot hold shutdown hostage forever.
    let drain = async {
        let _ = binding_task.await;
        let _ = rate_task.await;
        let _ = pattern_task.await;
        let _ = aggregator_task.await;
    };

    // Phase 1: wait for the capture side to finish (source end or signal)
    let capture_done = tokio::task::spawn_blocking(move || {
        let _ = capture_thread.join();
        let _ = normalizer_thread.join();
    });
    let _ = capture_done.await;

    // Phase 2: bounded drain of the detector/aggregator chain
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!(
            grace = ?config.shutdown_grace,
            "drain grace expired; discarding remaining in-flight items"
        );
    }

    Ok(())
}

fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    frame_tx: crossbeam_channel::Sender<RawFrame>,
    stats: Arc<EngineStats>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            let mut consecutive_errors = 0u32;
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    info!("capture stopping on shutdown signal");
                    break;
                }
                match source.next_frame() {
                    Ok(Some(frame)) => {
                        consecutive_errors = 0;
                        stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                        // Backpressure boundary: drop and count, never block
                        if frame_tx.try_send(frame).is_err() {
                            stats.intake_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(None) => {
                        if source.is_eof() {
                            info!("capture source exhausted");
                            break;
                        }
                    }
                    Err(err) => {
                        consecutive_errors += 1;
                        warn!(error = %err, "capture read error");
                        if consecutive_errors >= 10 {
                            warn!("too many consecutive capture errors, stopping");
                            break;
                        }
                    }
                }
            }
        })
        .expect("spawn capture thread")
}

fn spawn_normalizer(
    frame_rx: crossbeam_channel::Receiver<RawFrame>,
    detector_txs: [mpsc::Sender<ArpEvent>; 3],
    stats: Arc<EngineStats>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("normalizer".to_string())
        .spawn(move || {
            let normalizer = FrameNormalizer::new();
            // Runs until the capture side hangs up, draining what is queued
            while let Ok(frame) = frame_rx.recv() {
                match normalizer.normalize(&frame) {
                    Ok(event) => {
                        for tx in &detector_txs {
                            if tx.try_send(event.clone()).is_err() {
                                stats.detector_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(err) => {
                        stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                        debug!(error = %err, "frame rejected");
                    }
                }
            }
            debug!("normalizer stopped");
        })
        .expect("spawn normalizer thread")
}

async fn binding_loop(
    mut rx: mpsc::Receiver<ArpEvent>,
    table: Arc<BindingTable>,
    event_tx: mpsc::Sender<DetectionEvent>,
    cleanup_interval: Duration,
    max_age: Duration,
) {
    let mut cleanup = tokio::time::interval(cleanup_interval);
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else { break };
                if let Some(detection) = table.observe(&event) {
                    if event_tx.send(detection).await.is_err() {
                        break;
                    }
                }
            }
            _ = cleanup.tick() => {
                table.cleanup(max_age);
            }
        }
    }
    debug!("binding detector stopped");
}

async fn rate_loop(
    mut rx: mpsc::Receiver<ArpEvent>,
    mut rate: RateDetector,
    event_tx: mpsc::Sender<DetectionEvent>,
    tick_interval: Duration,
) {
    let mut tick = tokio::time::interval(tick_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else { break };
                rate.record(&event);
            }
            _ = tick.tick() => {
                for interface in rate.interfaces() {
                    for detection in rate.tick(&interface) {
                        if event_tx.send(detection).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
    debug!("rate detector stopped");
}

async fn pattern_loop(
    mut rx: mpsc::Receiver<ArpEvent>,
    mut patterns: PatternEngine,
    event_tx: mpsc::Sender<DetectionEvent>,
    max_context_pairs: usize,
) {
    while let Some(event) = rx.recv().await {
        for detection in patterns.observe(&event) {
            if event_tx.send(detection).await.is_err() {
                return;
            }
        }
        patterns.prune_contexts(max_context_pairs);
    }
    debug!("pattern detector stopped");
}

async fn aggregator_loop(
    mut rx: mpsc::Receiver<DetectionEvent>,
    mut aggregator: Aggregator,
    manager: AlertManager,
    stats: Arc<EngineStats>,
    flush_interval: Duration,
) {
    let mut flush = tokio::time::interval(flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        stats.events_detected.fetch_add(1, Ordering::Relaxed);
                        aggregator.ingest(event);
                    }
                    None => {
                        // Detectors are done: drain every open incident
                        for assessment in aggregator.flush_all() {
                            stats.assessments.fetch_add(1, Ordering::Relaxed);
                            manager.submit(assessment);
                        }
                        break;
                    }
                }
            }
            _ = flush.tick() => {
                for assessment in aggregator.flush_expired() {
                    stats.assessments.fetch_add(1, Ordering::Relaxed);
                    manager.submit(assessment);
                }
            }
        }
    }
    debug!("aggregator stopped");
}

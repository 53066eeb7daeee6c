//! Match reconciler implementation.
//!
//! A single timer spawns one tick per interval. A tick that fires while the
//! previous one is still running is skipped, never queued. Each tick sweeps
//! expired leases, then scans the three stages concurrently and reconciles
//! every selected match concurrently through the [`StageEngine`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::{ReconcileOutcome, StageEngine};
use crate::matches::{Match, MatchFilter, StageName, StageStatus};
use crate::metrics;

use super::config::ReconcilerConfig;
use super::types::{ReconcilerError, ReconcilerStatus, ScanReport, TickReport};

/// Which matches a scan of `stage` selects.
///
/// Examined matches are marked scanned, so a window full of matches that
/// never advance still rotates through every due match.
pub fn scan_filter(stage: StageName, limit: i64) -> MatchFilter {
    MatchFilter::new().with_due(stage).with_limit(limit)
}

#[derive(Debug, Default)]
struct TickStats {
    completed: u64,
    skipped: u64,
    last: Option<TickReport>,
}

/// Clears the tick-running flag when the tick ends, even by panic.
struct TickGuard(Arc<AtomicBool>);

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// State shared between the reconciler and its spawned ticks.
#[derive(Clone)]
struct Ticker {
    engine: Arc<StageEngine>,
    scan_limit: i64,
    tick_running: Arc<AtomicBool>,
    stats: Arc<RwLock<TickStats>>,
}

impl Ticker {
    /// Run one tick unless another is in progress.
    async fn try_tick(&self) -> Result<TickReport, ReconcilerError> {
        if self.tick_running.swap(true, Ordering::SeqCst) {
            self.stats.write().await.skipped += 1;
            metrics::RECONCILER_TICKS.with_label_values(&["skipped"]).inc();
            debug!("Previous tick still running, skipping");
            return Err(ReconcilerError::TickInProgress);
        }
        let _guard = TickGuard(Arc::clone(&self.tick_running));

        let report = self.run_tick().await;

        let mut stats = self.stats.write().await;
        stats.completed += 1;
        stats.last = Some(report.clone());
        Ok(report)
    }

    async fn run_tick(&self) -> TickReport {
        let started_at = Utc::now();
        let start = Instant::now();

        let leases_swept = match self.engine.leases().sweep() {
            Ok(swept) => {
                if swept > 0 {
                    metrics::LEASES_SWEPT.inc_by(swept as u64);
                    debug!("Swept {} expired leases", swept);
                }
                swept
            }
            Err(e) => {
                warn!("Failed to sweep expired leases: {}", e);
                0
            }
        };

        let (ingestion, detection, analysis) = tokio::join!(
            self.scan(StageName::Ingestion),
            self.scan(StageName::Detection),
            self.scan(StageName::Analysis),
        );

        let elapsed = start.elapsed();
        metrics::RECONCILER_TICKS
            .with_label_values(&["completed"])
            .inc();
        metrics::RECONCILER_TICK_DURATION
            .with_label_values(&[])
            .observe(elapsed.as_secs_f64());

        let report = TickReport {
            started_at,
            duration_ms: elapsed.as_millis() as u64,
            leases_swept,
            scans: vec![ingestion, detection, analysis],
        };
        if report.total_advanced() > 0 || report.total_errors() > 0 {
            info!(
                "Tick finished in {}ms: {} advanced, {} errors",
                report.duration_ms,
                report.total_advanced(),
                report.total_errors()
            );
        }
        report
    }

    async fn scan(&self, stage: StageName) -> ScanReport {
        let mut report = ScanReport::new(stage);

        if !self.engine.services().is_configured(stage) {
            debug!("Skipping {} scan: service not configured", stage);
            report.disabled = true;
            return report;
        }

        let candidates = match self.candidates(stage) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Failed to select matches for {} scan: {}", stage, e);
                metrics::RECONCILE_ERRORS
                    .with_label_values(&[stage.as_str()])
                    .inc();
                report.errors += 1;
                return report;
            }
        };
        report.examined = candidates.len();

        let outcomes = join_all(
            candidates
                .iter()
                .map(|m| self.engine.reconcile(&m.id, stage)),
        )
        .await;

        let examined: Vec<String> = candidates.iter().map(|m| m.id.clone()).collect();
        if let Err(e) = self.engine.matches().mark_scanned(stage, &examined) {
            warn!("Failed to record {} scan position: {}", stage, e);
        }

        for (m, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                Ok(ReconcileOutcome::Locked) => report.locked += 1,
                Ok(outcome) if outcome.advanced() => report.advanced += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!("Reconciling {} of match {} failed: {}", stage, m.id, e);
                    metrics::RECONCILE_ERRORS
                        .with_label_values(&[stage.as_str()])
                        .inc();
                    report.errors += 1;
                }
            }
        }

        report
    }

    fn candidates(&self, stage: StageName) -> Result<Vec<Match>, ReconcilerError> {
        Ok(self
            .engine
            .matches()
            .list(&scan_filter(stage, self.scan_limit))?)
    }
}

/// The match reconciler - periodically advances every in-flight stage.
pub struct MatchReconciler {
    config: ReconcilerConfig,
    ticker: Ticker,

    // Runtime state
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MatchReconciler {
    /// Create a new reconciler.
    pub fn new(config: ReconcilerConfig, engine: Arc<StageEngine>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            ticker: Ticker {
                engine,
                scan_limit: config.scan_limit,
                tick_running: Arc::new(AtomicBool::new(false)),
                stats: Arc::new(RwLock::new(TickStats::default())),
            },
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Start the periodic loop (spawns a background task).
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Reconciler already running");
            return;
        }

        info!(
            "Starting match reconciler (tick every {}ms)",
            self.config.tick_interval_ms
        );

        let running = Arc::clone(&self.running);
        let ticker = self.ticker.clone();
        let period = self.config.tick_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Reconciler loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        // Spawned so a slow tick never delays the timer.
                        let ticker = ticker.clone();
                        tokio::spawn(async move {
                            let _ = ticker.try_tick().await;
                        });
                    }
                }
            }
            info!("Reconciler loop stopped");
        });
    }

    /// Stop the loop and wait briefly for the running tick to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Reconciler not running");
            return;
        }

        info!("Stopping match reconciler");
        let _ = self.shutdown_tx.send(());

        let deadline = Instant::now() + Duration::from_secs(5);
        while self.ticker.tick_running.load(Ordering::SeqCst) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("Match reconciler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Run a tick now, outside the timer.
    ///
    /// Fails with [`ReconcilerError::TickInProgress`] if a tick is running.
    pub async fn tick_now(&self) -> Result<TickReport, ReconcilerError> {
        self.ticker.try_tick().await
    }

    /// Get current reconciler status.
    pub async fn status(&self) -> ReconcilerStatus {
        let stats = self.ticker.stats.read().await;
        let matches = self.ticker.engine.matches();
        let count = |filter: MatchFilter| matches.count(&filter).unwrap_or(0) as usize;

        ReconcilerStatus {
            running: self.is_running(),
            tick_in_progress: self.ticker.tick_running.load(Ordering::SeqCst),
            ticks_completed: stats.completed,
            ticks_skipped: stats.skipped,
            last_tick: stats.last.clone(),
            ingestion_processing: count(
                MatchFilter::new().with_ingestion_status([StageStatus::Processing]),
            ),
            detection_processing: count(
                MatchFilter::new().with_detection_status([StageStatus::Processing]),
            ),
            analysis_pending: count(MatchFilter::new().with_analysis_status([StageStatus::Pending])),
            analysis_processing: count(
                MatchFilter::new().with_analysis_status([StageStatus::Processing]),
            ),
        }
    }
}

//! Timed grid effects
//!
//! Effects run one at a time on a single worker fed by a bounded queue, so two
//! effects never interleave their writes. A trigger that is already queued or
//! running is not queued again. Once started, an effect always runs to its
//! last frame.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use rayon::prelude::*;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::canvas::constants::effects;
use crate::canvas::grid::{BoundsError, GridStore};
use crate::canvas::pattern::{Detection, Trigger};
use crate::metrics::Metrics;
use crate::net::broadcast::BroadcastScheduler;
use crate::net::protocol::CanvasMessage;

/// Effect pacing
#[derive(Debug, Clone, Copy)]
pub struct EffectTiming {
    /// Delay between animation steps
    pub step: Duration,
    /// Rows regenerated per fill frame
    pub fill_chunk_rows: usize,
}

impl Default for EffectTiming {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(effects::STEP_MS),
            fill_chunk_rows: 5,
        }
    }
}

/// Row band of the fill effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Sky,
    Middle,
    Ground,
}

impl Band {
    /// Top fifth is sky, bottom fifth is ground
    pub fn of(row: usize, rows: usize) -> Self {
        if row * 5 > rows * 4 {
            Band::Ground
        } else if row * 5 < rows {
            Band::Sky
        } else {
            Band::Middle
        }
    }

    /// Every pattern a cell in this band may hold
    pub fn palette(self) -> &'static [&'static str] {
        match self {
            Band::Sky => &effects::SKY_PATTERNS,
            Band::Middle => &effects::FILL_PATTERNS,
            Band::Ground => &effects::GROUND_PATTERNS,
        }
    }
}

/// One effect, from trigger to final frame
#[derive(Debug)]
struct EffectRun {
    detection: Detection,
    frames: usize,
}

/// Handle to the effect worker
pub struct EffectEngine {
    jobs: mpsc::Sender<EffectRun>,
    pending: Arc<Mutex<HashSet<Trigger>>>,
    metrics: Arc<Metrics>,
}

impl EffectEngine {
    /// Spawn the effect worker
    pub fn start(
        grid: Arc<GridStore>,
        scheduler: Arc<BroadcastScheduler>,
        timing: EffectTiming,
        metrics: Arc<Metrics>,
    ) -> Self {
        // Dedupe keeps at most one job per trigger in the queue
        let (jobs, rx) = mpsc::channel(Trigger::ALL.len());
        let pending = Arc::new(Mutex::new(HashSet::new()));

        tokio::spawn(run_worker(
            rx,
            grid,
            scheduler,
            timing,
            pending.clone(),
            metrics.clone(),
        ));

        Self {
            jobs,
            pending,
            metrics,
        }
    }

    /// Queue the effect for `detection` without waiting for it.
    ///
    /// Returns false if the same trigger is already pending or the worker is gone.
    pub fn trigger(&self, detection: Detection) -> bool {
        let trigger = detection.trigger;
        let mut pending = self.pending.lock();

        if pending.contains(&trigger) {
            debug!("{} already pending, ignoring", trigger);
            self.metrics.effects_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match self.jobs.try_send(EffectRun { detection, frames: 0 }) {
            Ok(()) => {
                pending.insert(trigger);
                true
            }
            Err(e) => {
                warn!("Effect worker unavailable, dropping {}: {}", trigger, e);
                self.metrics.effects_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// True while `trigger` is queued or running
    pub fn is_pending(&self, trigger: Trigger) -> bool {
        self.pending.lock().contains(&trigger)
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<EffectRun>,
    grid: Arc<GridStore>,
    scheduler: Arc<BroadcastScheduler>,
    timing: EffectTiming,
    pending: Arc<Mutex<HashSet<Trigger>>>,
    metrics: Arc<Metrics>,
) {
    while let Some(mut run) = rx.recv().await {
        let trigger = run.detection.trigger;
        info!("Starting {} effect ({:?} at {:?})", trigger, run.detection.line, run.detection.span);
        metrics.effects_started.fetch_add(1, Ordering::Relaxed);

        match trigger {
            Trigger::Bomb => run.frames = explode(&grid, &scheduler, timing.step).await,
            Trigger::Fill => match fill(&grid, &scheduler, timing).await {
                Ok(frames) => run.frames = frames,
                Err(e) => warn!("Fill aborted: {}", e),
            },
        }

        metrics.effects_completed.fetch_add(1, Ordering::Relaxed);
        pending.lock().remove(&trigger);
        info!("{} effect finished after {} frames", trigger, run.frames);
    }
}

/// Tint the grid through the explosion palette, then clear it.
///
/// Returns the number of frames submitted.
pub async fn explode(grid: &GridStore, scheduler: &BroadcastScheduler, step: Duration) -> usize {
    let mut frames = 0;

    for tint in effects::EXPLOSION_TINTS {
        scheduler.submit(CanvasMessage::explosion(grid.read(), tint));
        frames += 1;
        sleep(step).await;
    }

    grid.clear_all();
    sleep(step).await;

    scheduler.submit(CanvasMessage::grid(grid.read()));
    frames + 1
}

/// Regenerate the whole grid chunk by chunk, one frame per chunk.
///
/// Returns the number of frames submitted.
pub async fn fill(
    grid: &GridStore,
    scheduler: &BroadcastScheduler,
    timing: EffectTiming,
) -> Result<usize, BoundsError> {
    let (rows, cols) = grid.dimensions();
    let chunk = timing.fill_chunk_rows.max(1);
    let mut frames = 0;

    for start in (0..rows).step_by(chunk) {
        let end = (start + chunk).min(rows);
        let generated: Vec<Vec<String>> = (start..end)
            .into_par_iter()
            .map_init(rand::thread_rng, |rng, row| fill_row(rng, row, rows, cols))
            .collect();

        let snapshot = grid.write_rows(start, generated)?;
        scheduler.submit(CanvasMessage::tinted(snapshot, effects::FILL_TEXT_COLOR));
        frames += 1;

        if end < rows {
            sleep(timing.step).await;
        }
    }

    Ok(frames)
}

/// Generate one row of fill patterns for its band
pub fn fill_row<R: Rng>(rng: &mut R, row: usize, rows: usize, cols: usize) -> Vec<String> {
    let palette: &[&str] = match Band::of(row, rows) {
        Band::Middle if rng.gen_bool(effects::DENSE_ROW_CHANCE) => &effects::GROUND_PATTERNS,
        band => band.palette(),
    };

    (0..cols)
        .map(|_| palette[rng.gen_range(0..palette.len())].to_string())
        .collect()
}

//! Per-worker adaptive batch-size controller.
//!
//! Feeds on the observed insert latency of the last `window` batches and
//! steers the batch size toward the target latency: grow by half when well
//! under, halve when well over, hold otherwise. Every decision is recorded
//! in `batch_size_history`.

use chrono::Utc;
use sea_orm::{DatabaseConnection, NotSet, Set};

use crate::catalog;
use crate::entities::batch_adjustment;
use crate::errors::MigrateError;
use crate::settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjustment {
    pub old_batch_size: i64,
    pub new_batch_size: i64,
    pub avg_latency_ms: i64,
    pub target_latency_ms: i64,
    pub reason: String,
}

pub struct BatchController {
    current: i64,
    target_latency_ms: i64,
    min_batch: i64,
    max_batch: i64,
    window: usize,
    samples: Vec<i64>,
}

impl BatchController {
    pub fn new(initial: i64, cfg: &settings::Batch) -> Self {
        Self {
            current: initial.clamp(cfg.min_batch, cfg.max_batch),
            target_latency_ms: cfg.target_latency_ms,
            min_batch: cfg.min_batch,
            max_batch: cfg.max_batch,
            window: cfg.window.max(1),
            samples: Vec::new(),
        }
    }

    pub fn current_batch(&self) -> i64 {
        self.current
    }

    /// Record one batch latency. Returns a decision once a full window has
    /// been observed; `None` while the window is filling or when the
    /// latency sits inside the dead band.
    pub fn observe(&mut self, latency_ms: i64) -> Option<Adjustment> {
        self.samples.push(latency_ms.max(0));
        if self.samples.len() < self.window {
            return None;
        }
        let avg = self.samples.iter().sum::<i64>() / self.samples.len() as i64;
        self.samples.clear();

        let old = self.current;
        let (new, reason) = if avg * 2 < self.target_latency_ms {
            (
                (old * 3 / 2).min(self.max_batch),
                format!("avg latency {avg}ms below target {}ms", self.target_latency_ms),
            )
        } else if avg * 2 > self.target_latency_ms * 3 {
            (
                (old / 2).max(self.min_batch),
                format!("avg latency {avg}ms above target {}ms", self.target_latency_ms),
            )
        } else {
            return None;
        };
        if new == old {
            return None;
        }
        self.current = new;
        Some(Adjustment {
            old_batch_size: old,
            new_batch_size: new,
            avg_latency_ms: avg,
            target_latency_ms: self.target_latency_ms,
            reason,
        })
    }
}

pub async fn record_adjustment(
    db: &DatabaseConnection,
    job_id: &str,
    worker_id: &str,
    adjustment: &Adjustment,
) -> Result<(), MigrateError> {
    catalog::record_batch_adjustment(
        db,
        batch_adjustment::ActiveModel {
            id: NotSet,
            job_id: Set(job_id.to_string()),
            worker_id: Set(worker_id.to_string()),
            old_batch_size: Set(adjustment.old_batch_size),
            new_batch_size: Set(adjustment.new_batch_size),
            avg_latency_ms: Set(adjustment.avg_latency_ms),
            target_latency_ms: Set(adjustment.target_latency_ms),
            reason: Set(adjustment.reason.clone()),
            recorded_at: Set(Utc::now().timestamp()),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(initial: i64) -> BatchController {
        BatchController::new(initial, &settings::Batch::default())
    }

    #[test]
    fn grows_by_half_when_well_under_target() {
        let mut ctl = controller(5_000);
        for _ in 0..4 {
            assert!(ctl.observe(60).is_none());
        }
        let adjustment = ctl.observe(60).expect("adjustment after full window");
        assert_eq!(adjustment.old_batch_size, 5_000);
        assert_eq!(adjustment.new_batch_size, 7_500);
        assert_eq!(adjustment.avg_latency_ms, 60);
        assert!(adjustment.reason.contains("below target"));
        assert_eq!(ctl.current_batch(), 7_500);
    }

    #[test]
    fn halves_when_well_over_target() {
        let mut ctl = controller(10_000);
        let mut adjustment = None;
        for _ in 0..5 {
            adjustment = ctl.observe(450);
        }
        let adjustment = adjustment.expect("adjustment");
        assert_eq!(adjustment.new_batch_size, 5_000);
        assert!(adjustment.reason.contains("above target"));
    }

    #[test]
    fn holds_inside_dead_band() {
        let mut ctl = controller(5_000);
        for _ in 0..5 {
            assert!(ctl.observe(200).is_none());
        }
        assert_eq!(ctl.current_batch(), 5_000);
    }

    #[test]
    fn respects_floor_and_ceiling() {
        let mut ctl = controller(600);
        for _ in 0..5 {
            ctl.observe(10_000);
        }
        assert_eq!(ctl.current_batch(), 500);

        let mut ctl = controller(40_000);
        for _ in 0..5 {
            ctl.observe(1);
        }
        assert_eq!(ctl.current_batch(), 50_000);
        for _ in 0..5 {
            ctl.observe(1);
        }
        assert_eq!(ctl.current_batch(), 50_000);
    }

    #[test]
    fn window_resets_between_decisions() {
        let mut ctl = controller(5_000);
        for _ in 0..5 {
            ctl.observe(60);
        }
        assert_eq!(ctl.current_batch(), 7_500);
        // A fresh window must fill before the next decision
        for _ in 0..4 {
            assert!(ctl.observe(60).is_none());
        }
        assert!(ctl.observe(60).is_some());
    }
}

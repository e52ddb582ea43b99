//! Learning-rate schedules.
//!
//! Every schedule is a continuous piecewise curve over optimiser steps:
//!
//! ```text
//! [0, warm_up)                 linear ramp 0 → base
//! [warm_up, total)             constant | cosine base → end | num_cycles cosine cycles
//! [total - decay, total]       annealing kinds only: linear ramp → end
//! ```
//!
//! `Constant` has no decay region.

use serde::{Deserialize, Serialize};

use sae_common::{LrSchedulerKind, SaeConfig};

// ── State ───────────────────────────────────────────────────────────────────

/// Persisted scheduler state; everything else is rebuilt from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub step: usize,
}

// ── LR Scheduler ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LrScheduler {
    step: usize,
    kind: LrSchedulerKind,
    base_lr: f64,
    end_lr: f64,
    warm_up_steps: usize,
    decay_steps: usize,
    total_steps: usize,
    num_cycles: usize,
}

impl LrScheduler {
    pub fn new(
        kind: LrSchedulerKind,
        base_lr: f64,
        end_lr: f64,
        warm_up_steps: usize,
        decay_steps: usize,
        total_steps: usize,
        num_cycles: usize,
    ) -> Self {
        Self {
            step: 0,
            kind,
            base_lr,
            end_lr,
            warm_up_steps,
            decay_steps,
            total_steps,
            num_cycles: num_cycles.max(1),
        }
    }

    pub fn from_sae_config(cfg: &SaeConfig, total_steps: usize) -> Self {
        Self::new(
            cfg.lr_scheduler_name,
            cfg.lr,
            cfg.lr_end,
            cfg.lr_warm_up_steps,
            cfg.lr_decay_steps,
            total_steps,
            cfg.n_restart_cycles,
        )
    }

    /// First step of the decay region.
    fn decay_start(&self) -> usize {
        self.total_steps
            .saturating_sub(self.decay_steps)
            .max(self.warm_up_steps)
    }

    fn cosine(&self, t: f64, period: f64) -> f64 {
        let cos = (std::f64::consts::PI * (t / period).min(1.0)).cos();
        self.end_lr + 0.5 * (self.base_lr - self.end_lr) * (1.0 + cos)
    }

    /// Annealing curve over the whole post-warm-up region, ignoring decay.
    fn annealed(&self, step: usize) -> f64 {
        let post_len = self.total_steps.saturating_sub(self.warm_up_steps).max(1);
        let t = step.saturating_sub(self.warm_up_steps);
        match self.kind {
            LrSchedulerKind::Constant => self.base_lr,
            LrSchedulerKind::CosineAnneal => self.cosine(t as f64, post_len as f64),
            LrSchedulerKind::CosineAnnealWithRestarts => {
                // The last cycle absorbs the remainder, so exactly `num_cycles`
                // cycles start at `base_lr`.
                let cycle_len = (post_len / self.num_cycles).max(1);
                let cycle = (t / cycle_len).min(self.num_cycles - 1);
                let cycle_start = cycle * cycle_len;
                let len = if cycle == self.num_cycles - 1 {
                    post_len.saturating_sub(cycle_start).max(1)
                } else {
                    cycle_len
                };
                self.cosine((t - cycle_start) as f64, len as f64)
            }
        }
    }

    /// Learning rate at an arbitrary step.
    pub fn rate(&self, step: usize) -> f64 {
        if step < self.warm_up_steps {
            return self.base_lr * step as f64 / self.warm_up_steps as f64;
        }
        if self.kind == LrSchedulerKind::Constant {
            return self.base_lr;
        }

        let decay_start = self.decay_start();
        if self.decay_steps > 0 && step >= decay_start {
            let from = self.annealed(decay_start);
            let progress = ((step - decay_start) as f64 / self.decay_steps as f64).min(1.0);
            return from + (self.end_lr - from) * progress;
        }
        self.annealed(step)
    }

    /// Learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        self.rate(self.step)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState { step: self.step }
    }

    pub fn hydrate(&mut self, state: SchedulerState) {
        self.step = state.step;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sched(kind: LrSchedulerKind, warm: usize, decay: usize) -> LrScheduler {
        LrScheduler::new(kind, 1e-3, 1e-4, warm, decay, 1000, 4)
    }

    #[test]
    fn warm_up_starts_at_zero_and_reaches_base() {
        for kind in [
            LrSchedulerKind::Constant,
            LrSchedulerKind::CosineAnneal,
            LrSchedulerKind::CosineAnnealWithRestarts,
        ] {
            let s = sched(kind, 100, 0);
            assert_eq!(s.rate(0), 0.0);
            assert!((s.rate(50) - 5e-4).abs() < 1e-12);
            assert!((s.rate(100) - 1e-3).abs() < 1e-12);
        }
    }

    #[test]
    fn no_warm_up_starts_at_base() {
        let s = sched(LrSchedulerKind::Constant, 0, 0);
        assert_eq!(s.rate(0), 1e-3);
        assert_eq!(s.rate(999), 1e-3);
    }

    #[test]
    fn cosine_anneals_to_end() {
        let s = sched(LrSchedulerKind::CosineAnneal, 0, 0);
        // Midpoint of cosine: halfway between base and end.
        assert!((s.rate(500) - 5.5e-4).abs() < 1e-9);
        assert!((s.rate(1000) - 1e-4).abs() < 1e-9);
    }

    #[test]
    fn restarts_return_to_base() {
        let s = sched(LrSchedulerKind::CosineAnnealWithRestarts, 0, 0);
        // 4 cycles of 250 steps.
        assert!((s.rate(0) - 1e-3).abs() < 1e-12);
        assert!(s.rate(249) < 2e-4);
        assert!((s.rate(250) - 1e-3).abs() < 1e-12);
        assert!((s.rate(500) - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn uneven_restarts_keep_cycle_count() {
        let s = LrScheduler::new(LrSchedulerKind::CosineAnnealWithRestarts, 1e-3, 1e-4, 0, 0, 10, 3);
        let restarts: Vec<usize> = (0..10)
            .filter(|&step| (s.rate(step) - 1e-3).abs() < 1e-12)
            .collect();
        assert_eq!(restarts, vec![0, 3, 6]);
        assert!(s.rate(9) < s.rate(8));
    }

    #[test]
    fn constant_ignores_decay() {
        let s = sched(LrSchedulerKind::Constant, 100, 200);
        assert_eq!(s.rate(800), 1e-3);
        assert_eq!(s.rate(900), 1e-3);
        assert_eq!(s.rate(1000), 1e-3);
    }

    #[test]
    fn annealing_decays_to_end() {
        for kind in [
            LrSchedulerKind::CosineAnneal,
            LrSchedulerKind::CosineAnnealWithRestarts,
        ] {
            let s = sched(kind, 100, 200);
            let at_start = s.rate(800);
            assert!(at_start > 1e-4, "{kind:?}");
            let mid = s.rate(900);
            assert!((mid - (at_start + 1e-4) / 2.0).abs() < 1e-12, "{kind:?}");
            assert!((s.rate(1000) - 1e-4).abs() < 1e-12, "{kind:?}");
        }
    }

    #[test]
    fn curve_is_continuous() {
        for kind in [LrSchedulerKind::Constant, LrSchedulerKind::CosineAnneal] {
            let s = sched(kind, 100, 200);
            for step in 1..1000 {
                assert!(
                    (s.rate(step) - s.rate(step - 1)).abs() < 2e-5,
                    "{kind:?} jumps at {step}"
                );
            }
        }
    }

    #[test]
    fn state_round_trip() {
        let mut s = sched(LrSchedulerKind::CosineAnneal, 10, 0);
        for _ in 0..37 {
            s.advance();
        }
        let mut fresh = sched(LrSchedulerKind::CosineAnneal, 10, 0);
        fresh.hydrate(s.state());
        assert_eq!(fresh.step(), 37);
        assert_eq!(fresh.current_lr(), s.current_lr());
    }
}

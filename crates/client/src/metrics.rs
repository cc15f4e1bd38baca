//! 1 Hz metrics sampling: exponential moving averages plus the
//! downgrade/upgrade trigger evaluation, independent of any browser API so
//! it can be unit tested directly.

const EMA_ALPHA: f64 = 0.15;
const DOWNGRADE_LOSS: f64 = 0.10;
const DOWNGRADE_RTT_MS: f64 = 500.0;
const DOWNGRADE_FPS: f64 = 10.0;
const DOWNGRADE_BITRATE_RATIO: f64 = 0.7;
const CRITICAL_RTT_MS: f64 = 3_000.0;
const CRITICAL_FPS: f64 = 1.0;
const UPGRADE_LOSS: f64 = 0.05;
const UPGRADE_RTT_MS: f64 = 200.0;
const UPGRADE_FPS: f64 = 25.0;
const DOWNGRADE_PERSISTENCE_TICKS: u32 = 4;
const UPGRADE_PERSISTENCE_TICKS: u32 = 8;

/// One second's worth of raw observations, before smoothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSample {
    pub rtt_inst_ms: f64,
    pub loss_inst: f64,
    pub bitrate_inst_kbps: f64,
    pub fps_3s: f64,
    pub audio_only: bool,
}

/// Smoothed metric state, carried tick to tick.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    rtt_ms: f64,
    loss: f64,
    fps: f64,
    seeded: bool,
}

impl Default for Ema {
    fn default() -> Self {
        Self { rtt_ms: 0.0, loss: 0.0, fps: 30.0, seeded: false }
    }
}

impl Ema {
    /// Update with one tick's sample. The first tick seeds directly instead
    /// of blending against the zeroed defaults.
    pub fn update(&mut self, sample: &MetricsSample) {
        if !self.seeded {
            self.rtt_ms = sample.rtt_inst_ms;
            self.loss = sample.loss_inst;
            self.fps = sample.fps_3s;
            self.seeded = true;
            return;
        }
        self.rtt_ms = EMA_ALPHA * sample.rtt_inst_ms + (1.0 - EMA_ALPHA) * self.rtt_ms;
        self.loss = EMA_ALPHA * sample.loss_inst + (1.0 - EMA_ALPHA) * self.loss;
        self.fps = EMA_ALPHA * sample.fps_3s + (1.0 - EMA_ALPHA) * self.fps;
    }

    pub fn rtt_ms(&self) -> f64 {
        self.rtt_ms
    }

    pub fn loss(&self) -> f64 {
        self.loss
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}

/// Verdict for one tick's trigger evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    None,
    Downgrade,
    CriticalDowngrade,
    Upgrade,
}

/// Tracks the persistence counters across ticks and emits a [`Trigger`].
/// `honeymoon`/`cooldown` suppress video-quality-based (non-loss/rtt)
/// triggers and all auto-decisions respectively; callers gate those at the
/// call site per the state machine's timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerEvaluator {
    downgrade_streak: u32,
    upgrade_streak: u32,
}

impl TriggerEvaluator {
    /// `expected_bitrate_kbps` is the current level's configured cap, or a
    /// best-effort estimate for the unlimited top level.
    pub fn evaluate(
        &mut self,
        ema: &Ema,
        sample: &MetricsSample,
        expected_bitrate_kbps: f64,
        honeymoon_active: bool,
    ) -> Trigger {
        if !sample.audio_only && !honeymoon_active {
            if ema.rtt_ms() > CRITICAL_RTT_MS || sample.fps_3s <= CRITICAL_FPS {
                self.downgrade_streak = 0;
                self.upgrade_streak = 0;
                return Trigger::CriticalDowngrade;
            }
        }

        let video_quality_trigger = !sample.audio_only
            && !honeymoon_active
            && (sample.fps_3s < DOWNGRADE_FPS || sample.bitrate_inst_kbps < DOWNGRADE_BITRATE_RATIO * expected_bitrate_kbps);
        let downgrade_condition = ema.loss() > DOWNGRADE_LOSS || ema.rtt_ms() > DOWNGRADE_RTT_MS || video_quality_trigger;

        if downgrade_condition {
            self.downgrade_streak += 1;
            self.upgrade_streak = 0;
        } else {
            self.downgrade_streak = 0;
        }
        if self.downgrade_streak >= DOWNGRADE_PERSISTENCE_TICKS {
            self.downgrade_streak = 0;
            return Trigger::Downgrade;
        }

        let fps_ok = sample.audio_only || sample.fps_3s >= UPGRADE_FPS;
        let upgrade_condition = ema.loss() <= UPGRADE_LOSS && ema.rtt_ms() < UPGRADE_RTT_MS && fps_ok;
        if upgrade_condition && !downgrade_condition {
            self.upgrade_streak += 1;
        } else {
            self.upgrade_streak = 0;
        }
        if self.upgrade_streak >= UPGRADE_PERSISTENCE_TICKS {
            self.upgrade_streak = 0;
            return Trigger::Upgrade;
        }

        Trigger::None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bad_sample() -> MetricsSample {
        MetricsSample { rtt_inst_ms: 600.0, loss_inst: 0.0, bitrate_inst_kbps: 1000.0, fps_3s: 30.0, audio_only: false }
    }

    fn good_sample() -> MetricsSample {
        MetricsSample { rtt_inst_ms: 50.0, loss_inst: 0.0, bitrate_inst_kbps: 1000.0, fps_3s: 30.0, audio_only: false }
    }

    #[test]
    fn first_tick_seeds_ema_directly() {
        let mut ema = Ema::default();
        ema.update(&good_sample());
        assert_eq!(ema.rtt_ms(), 50.0);
    }

    #[test]
    fn downgrade_requires_four_consecutive_ticks() {
        let mut ema = Ema::default();
        let mut eval = TriggerEvaluator::default();
        let sample = bad_sample();
        for _ in 0..3 {
            ema.update(&sample);
            assert_eq!(eval.evaluate(&ema, &sample, 2000.0, false), Trigger::None);
        }
        ema.update(&sample);
        assert_eq!(eval.evaluate(&ema, &sample, 2000.0, false), Trigger::Downgrade);
    }

    #[test]
    fn critical_downgrade_skips_persistence() {
        let mut ema = Ema::default();
        let mut eval = TriggerEvaluator::default();
        let sample = MetricsSample { rtt_inst_ms: 4_000.0, loss_inst: 0.0, bitrate_inst_kbps: 1000.0, fps_3s: 30.0, audio_only: false };
        ema.update(&sample);
        assert_eq!(eval.evaluate(&ema, &sample, 2000.0, false), Trigger::CriticalDowngrade);
    }

    #[test]
    fn honeymoon_suppresses_video_quality_trigger_but_not_loss_or_rtt() {
        let mut ema = Ema::default();
        let mut eval = TriggerEvaluator::default();
        let low_fps = MetricsSample { rtt_inst_ms: 50.0, loss_inst: 0.0, bitrate_inst_kbps: 1000.0, fps_3s: 2.0, audio_only: false };
        for _ in 0..4 {
            ema.update(&low_fps);
            assert_eq!(eval.evaluate(&ema, &low_fps, 2000.0, true), Trigger::None);
        }
    }

    #[test]
    fn upgrade_requires_eight_consecutive_good_ticks() {
        let mut ema = Ema::default();
        let mut eval = TriggerEvaluator::default();
        let sample = good_sample();
        ema.update(&sample);
        for _ in 0..7 {
            assert_eq!(eval.evaluate(&ema, &sample, 2000.0, false), Trigger::None);
            ema.update(&sample);
        }
        assert_eq!(eval.evaluate(&ema, &sample, 2000.0, false), Trigger::Upgrade);
    }
}

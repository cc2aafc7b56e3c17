//! Stepped volume ramps used around playback transitions.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::settings::TimingSettings;

/// Computes and executes linear volume fades.
#[derive(Clone, Debug)]
pub struct VolumeFader {
    steps: u32,
    fade_in: Duration,
    fade_out_fallback: Duration,
    fade_out_max: Duration,
    drain: Duration,
}

impl VolumeFader {
    pub fn new(timing: &TimingSettings) -> Self {
        Self {
            steps: timing.fade_steps.max(1),
            fade_in: timing.fade_in,
            fade_out_fallback: timing.fade_out_fallback,
            fade_out_max: timing.fade_out_max,
            drain: timing.drain,
        }
    }

    pub fn fade_in_duration(&self) -> Duration {
        self.fade_in
    }

    pub fn drain_duration(&self) -> Duration {
        self.drain
    }

    /// Fade-out length for the given decoder buffer depth.
    ///
    /// Uses `min(buffered, max)` when the depth is known, the fallback
    /// otherwise.
    pub fn fade_out_duration(&self, buffered_secs: Option<f64>) -> Duration {
        match buffered_secs {
            Some(secs) if secs.is_finite() && secs >= 0.0 => {
                Duration::from_secs_f64(secs).min(self.fade_out_max)
            }
            _ => self.fade_out_fallback,
        }
    }

    /// Volume issued at step `step` (1-based) of a ramp from `from` to `to`.
    pub fn step_volume(&self, from: u8, to: u8, step: u32) -> u8 {
        let step = step.min(self.steps);
        let from = from as f64;
        let to = to as f64;
        let value = from + (to - from) * step as f64 / self.steps as f64;
        value.round().clamp(0.0, 100.0) as u8
    }

    /// Ramps from `from` to `to` over `duration`, calling `setter` once per
    /// step with a sleep of `duration / steps` between calls, and a final
    /// call with exactly `to`.
    pub async fn fade_to<F, Fut>(&self, from: u8, to: u8, duration: Duration, mut setter: F)
    where
        F: FnMut(u8) -> Fut,
        Fut: Future<Output = ()>,
    {
        if duration.is_zero() || from == to {
            setter(to).await;
            return;
        }

        let interval = duration / self.steps;
        debug!(from, to, ?duration, steps = self.steps, "Starting volume fade");

        for step in 1..=self.steps {
            setter(self.step_volume(from, to, step)).await;
            tokio::time::sleep(interval).await;
        }
        setter(to).await;
    }

    /// Waits for hardware buffers to empty after a fade-out.
    pub async fn drain(&self) {
        if !self.drain.is_zero() {
            tokio::time::sleep(self.drain).await;
        }
    }
}

impl Default for VolumeFader {
    fn default() -> Self {
        Self::new(&TimingSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fast_fader() -> VolumeFader {
        VolumeFader::new(&TimingSettings {
            fade_in: Duration::from_millis(40),
            ..Default::default()
        })
    }

    async fn record(fader: &VolumeFader, from: u8, to: u8, duration: Duration) -> Vec<u8> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        fader
            .fade_to(from, to, duration, move |v| {
                sink.lock().unwrap().push(v);
                async {}
            })
            .await;
        let calls = calls.lock().unwrap().clone();
        calls
    }

    #[tokio::test]
    async fn test_fade_up_is_monotonic_and_exact() {
        let fader = fast_fader();
        let calls = record(&fader, 0, 100, Duration::from_millis(40)).await;

        assert_eq!(calls.len(), 21);
        assert!(calls.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*calls.last().unwrap(), 100);
        assert_eq!(calls[0], 5);
    }

    #[tokio::test]
    async fn test_fade_down_is_monotonic_and_exact() {
        let fader = fast_fader();
        let calls = record(&fader, 75, 0, Duration::from_millis(40)).await;

        assert!(calls.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(*calls.last().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_duration_sets_target_once() {
        let fader = fast_fader();
        assert_eq!(record(&fader, 10, 60, Duration::ZERO).await, vec![60]);
        assert_eq!(record(&fader, 60, 60, Duration::from_millis(40)).await, vec![60]);
    }

    #[tokio::test]
    async fn test_noop_setter_is_tolerated() {
        let fader = fast_fader();
        fader
            .fade_to(0, 80, Duration::from_millis(20), |_| async {})
            .await;
    }

    #[test]
    fn test_fade_out_duration_bounds() {
        let fader = VolumeFader::default();

        assert_eq!(fader.fade_out_duration(None), Duration::from_secs(2));
        assert_eq!(fader.fade_out_duration(Some(f64::NAN)), Duration::from_secs(2));
        assert_eq!(fader.fade_out_duration(Some(-1.0)), Duration::from_secs(2));
        assert_eq!(fader.fade_out_duration(Some(3.5)), Duration::from_millis(3500));
        assert_eq!(fader.fade_out_duration(Some(12.0)), Duration::from_secs(5));

        for depth in [0.0, 0.7, 4.99, 5.0, 5.01, 60.0] {
            assert!(fader.fade_out_duration(Some(depth)) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_step_volume_interpolation() {
        let fader = VolumeFader::default();
        assert_eq!(fader.step_volume(0, 75, 10), 38);
        assert_eq!(fader.step_volume(0, 75, 20), 75);
        assert_eq!(fader.step_volume(80, 0, 5), 60);
    }
}

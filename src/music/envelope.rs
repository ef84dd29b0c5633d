//! Software volume envelope and buffer-ahead pacing for music playback.

use std::time::Duration;

/// Exponential step from `current` toward `target`.
///
/// Uses `tau_down` while falling and `tau_up` while rising; the smoothing
/// factor is `1 − e^(−dt/τ)` clamped to `[0, 1]`. A zero `dt` or zero `τ`
/// jumps straight to the target. Both inputs and the result are clamped to
/// `[0, 1]`.
pub fn step_volume(
    current: f64,
    target: f64,
    dt: Duration,
    tau_down: Duration,
    tau_up: Duration,
) -> f64 {
    let current = clamp_unit(current);
    let target = clamp_unit(target);
    if dt.is_zero() {
        return target;
    }
    if current == target {
        return current;
    }
    let tau = if target < current { tau_down } else { tau_up };
    if tau.is_zero() {
        return target;
    }
    let alpha = (1.0 - (-dt.as_secs_f64() / tau.as_secs_f64()).exp()).clamp(0.0, 1.0);
    clamp_unit(current + (target - current) * alpha)
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// How long to sleep so written audio leads the wall clock by about
/// `target_ahead`. `None` while the lead is within `max_ahead`.
pub fn pacing_delay(
    written_samples: u64,
    sample_rate: u32,
    elapsed: Duration,
    max_ahead: Duration,
    target_ahead: Duration,
) -> Option<Duration> {
    if sample_rate == 0 {
        return None;
    }
    let nanos = u128::from(written_samples) * 1_000_000_000 / u128::from(sample_rate);
    let audio = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
    let ahead = audio.checked_sub(elapsed)?;
    if ahead <= max_ahead {
        return None;
    }
    let sleep = ahead.saturating_sub(target_ahead);
    (!sleep.is_zero()).then_some(sleep)
}

/// Scale S16_LE samples by `gain`, saturating at the int16 range. A trailing
/// odd byte is left untouched.
pub fn scale_pcm_in_place(pcm: &mut [u8], gain: f64) {
    if gain == 1.0 {
        return;
    }
    for pair in pcm.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = (f64::from(sample) * gain).clamp(f64::from(i16::MIN), f64::from(i16::MAX));
        pair.copy_from_slice(&(scaled as i16).to_le_bytes());
    }
}

/// Target/current gain pair shared between control calls and the play loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeEnvelope {
    /// Where the gain is heading.
    pub target: f64,
    /// Gain applied to the next chunk.
    pub current: f64,
}

impl Default for VolumeEnvelope {
    fn default() -> Self {
        Self {
            target: 1.0,
            current: 1.0,
        }
    }
}

impl VolumeEnvelope {
    /// Lower the target and clamp the current gain to `ceiling` at once, so
    /// the first ducked chunk is already audibly quieter.
    pub fn duck(&mut self, target: f64, ceiling: f64) {
        self.target = clamp_unit(target);
        self.current = self.current.min(clamp_unit(ceiling));
    }

    /// Head back to full volume.
    pub fn unduck(&mut self) {
        self.target = 1.0;
    }

    /// Full volume immediately, for a fresh track.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Advance by `dt` and return the gain to apply.
    pub fn advance(&mut self, dt: Duration, tau_down: Duration, tau_up: Duration) -> f64 {
        self.current = step_volume(self.current, self.target, dt, tau_down, tau_up);
        self.current
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    const DOWN: Duration = Duration::from_millis(120);
    const UP: Duration = Duration::from_millis(900);
    const CHUNK: Duration = Duration::from_millis(40);

    fn chunks_to_converge(from: f64, to: f64, eps: f64) -> usize {
        let mut env = VolumeEnvelope {
            target: to,
            current: from,
        };
        let mut n = 0;
        while (env.current - to).abs() > eps {
            env.advance(CHUNK, DOWN, UP);
            n += 1;
            assert!(n < 10_000, "did not converge");
        }
        n
    }

    // ── smoothing ────────────────────────────────────────────

    #[test]
    fn zero_dt_jumps_to_target() {
        assert_eq!(step_volume(1.0, 0.2, Duration::ZERO, DOWN, UP), 0.2);
    }

    #[test]
    fn one_time_constant_covers_most_of_the_gap() {
        let v = step_volume(1.0, 0.0, DOWN, DOWN, UP);
        let expected = (-1.0f64).exp();
        assert!((v - expected).abs() < 1e-9, "{v}");
    }

    #[test]
    fn output_is_always_clamped() {
        assert_eq!(step_volume(3.0, 5.0, CHUNK, DOWN, UP), 1.0);
        assert_eq!(step_volume(-1.0, -2.0, CHUNK, DOWN, UP), 0.0);
        assert_eq!(step_volume(f64::NAN, 0.5, Duration::ZERO, DOWN, UP), 0.5);
        let v = step_volume(0.5, 2.0, Duration::from_secs(100), DOWN, UP);
        assert!((0.0..=1.0).contains(&v));
    }

    #[test]
    fn duck_converges_within_its_window() {
        // 5τ of 40 ms chunks leaves less than 1% of the gap.
        let mut env = VolumeEnvelope::default();
        env.duck(0.2, 0.35);
        let chunks = (DOWN.as_millis() * 5 / CHUNK.as_millis()) as usize + 1;
        for _ in 0..chunks {
            env.advance(CHUNK, DOWN, UP);
        }
        assert!((env.current - 0.2).abs() < 0.01, "{}", env.current);
    }

    #[test]
    fn unduck_is_slower_than_duck_for_same_delta() {
        let down = chunks_to_converge(1.0, 0.2, 0.01);
        let up = chunks_to_converge(0.2, 1.0, 0.01);
        assert!(up > down * 3, "down={down} up={up}");
    }

    // ── envelope ─────────────────────────────────────────────

    #[test]
    fn duck_clamps_current_immediately() {
        let mut env = VolumeEnvelope::default();
        env.duck(0.2, 0.35);
        assert_eq!(env.target, 0.2);
        assert_eq!(env.current, 0.35);

        // Already quieter than the ceiling: untouched.
        env.current = 0.25;
        env.duck(0.2, 0.35);
        assert_eq!(env.current, 0.25);
    }

    #[test]
    fn unduck_only_moves_target() {
        let mut env = VolumeEnvelope {
            target: 0.2,
            current: 0.2,
        };
        env.unduck();
        assert_eq!(env.target, 1.0);
        assert_eq!(env.current, 0.2);
        let next = env.advance(CHUNK, DOWN, UP);
        assert!(next > 0.2 && next < 0.3, "{next}");
    }

    // ── pacing ───────────────────────────────────────────────

    #[test]
    fn no_delay_within_max_ahead() {
        // 160 ms written after 0 ms: 160 < 180.
        assert_eq!(
            pacing_delay(2560, 16_000, Duration::ZERO, Duration::from_millis(180), Duration::from_millis(120)),
            None
        );
    }

    #[test]
    fn delay_brings_lead_back_to_target() {
        // 400 ms written after 100 ms: 300 ms ahead, sleep 180 ms.
        let delay = pacing_delay(
            6400,
            16_000,
            Duration::from_millis(100),
            Duration::from_millis(180),
            Duration::from_millis(120),
        )
        .unwrap();
        assert_eq!(delay.as_millis(), 180);
    }

    #[test]
    fn behind_schedule_never_sleeps() {
        assert_eq!(
            pacing_delay(1600, 16_000, Duration::from_secs(1), Duration::from_millis(180), Duration::from_millis(120)),
            None
        );
        assert_eq!(pacing_delay(1600, 0, Duration::ZERO, Duration::ZERO, Duration::ZERO), None);
    }

    // ── scaling ──────────────────────────────────────────────

    #[test]
    fn scaling_halves_and_saturates() {
        let mut pcm = Vec::new();
        for s in [1000i16, -1000, i16::MAX, i16::MIN] {
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        let mut half = pcm.clone();
        scale_pcm_in_place(&mut half, 0.5);
        let samples: Vec<i16> = half
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![500, -500, 16383, -16384]);

        let mut loud = pcm;
        scale_pcm_in_place(&mut loud, 4.0);
        let samples: Vec<i16> = loud
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![4000, -4000, i16::MAX, i16::MIN]);
    }

    #[test]
    fn scaling_leaves_odd_tail_byte() {
        let mut pcm = vec![0x10, 0x00, 0x7f];
        scale_pcm_in_place(&mut pcm, 0.0);
        assert_eq!(pcm, vec![0x00, 0x00, 0x7f]);
    }
}

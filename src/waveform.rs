//! Pure waveform generation (§4.5): params in, a deterministic step list out.
//! No component here touches a `DeviceSession` or a clock — `SequenceController`
//! is the only caller, and it owns all timing decisions.

use rand::Rng;

use crate::model::{
    ArbitraryWaveform, ParametricKind, ParametricWaveform, RandomWalkWaveform, Waveform,
    WaveformStep,
};

/// Expands a `Waveform` into its ordered step list for one cycle.
///
/// `seed` is only consulted for `Waveform::Random`: on the first cycle it should be
/// `waveform.start_value`; on subsequent cycles it should be the last commanded
/// value, so the walk continues from where the device actually is.
pub fn generate(waveform: &Waveform, seed: f64) -> Vec<WaveformStep> {
    match waveform {
        Waveform::Sine(p) => sine(p),
        Waveform::Triangle(p) => triangle(p),
        Waveform::Ramp(p) => ramp(p),
        Waveform::Square(p) => square(p),
        Waveform::Steps(p) => ramp(p),
        Waveform::Random(p) => random_walk(p, seed),
        Waveform::Arbitrary(ArbitraryWaveform { steps }) => steps.clone(),
    }
}

fn sine(p: &ParametricWaveform) -> Vec<WaveformStep> {
    debug_assert_eq!(p.kind, ParametricKind::Sine);
    let n = p.points_per_cycle.max(1);
    let center = (p.min + p.max) / 2.0;
    let amplitude = (p.max - p.min) / 2.0;
    (1..=n)
        .map(|i| {
            let theta = 2.0 * std::f64::consts::PI * (i as f64) / (n as f64);
            WaveformStep {
                value: center + amplitude * theta.sin(),
                dwell_ms: p.interval_ms,
            }
        })
        .collect()
}

fn triangle(p: &ParametricWaveform) -> Vec<WaveformStep> {
    let n = p.points_per_cycle.max(1);
    (1..=n)
        .map(|i| {
            let t = i as f64 / n as f64;
            let value = if t <= 0.5 {
                p.min + (p.max - p.min) * 2.0 * t
            } else {
                p.max - (p.max - p.min) * 2.0 * (t - 0.5)
            };
            WaveformStep {
                value,
                dwell_ms: p.interval_ms,
            }
        })
        .collect()
}

fn ramp(p: &ParametricWaveform) -> Vec<WaveformStep> {
    let n = p.points_per_cycle.max(1);
    (0..n)
        .map(|i| {
            let t = if n > 1 {
                i as f64 / (n - 1) as f64
            } else {
                0.0
            };
            WaveformStep {
                value: p.min + (p.max - p.min) * t,
                dwell_ms: p.interval_ms,
            }
        })
        .collect()
}

fn square(p: &ParametricWaveform) -> Vec<WaveformStep> {
    let n = p.points_per_cycle.max(1);
    let high = n / 2;
    (0..n)
        .map(|i| WaveformStep {
            value: if i < high { p.max } else { p.min },
            dwell_ms: p.interval_ms,
        })
        .collect()
}

fn random_walk(p: &RandomWalkWaveform, seed: f64) -> Vec<WaveformStep> {
    let n = p.points_per_cycle.max(1);
    if n == 1 {
        return vec![WaveformStep {
            value: seed.clamp(p.min, p.max),
            dwell_ms: p.interval_ms,
        }];
    }
    let mut rng = rand::thread_rng();
    let mut prev = seed;
    (0..n)
        .map(|_| {
            let delta = rng.gen_range(-p.max_step_size..=p.max_step_size);
            let next = (prev + delta).clamp(p.min, p.max);
            prev = next;
            WaveformStep {
                value: next,
                dwell_ms: p.interval_ms,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parametric(kind: ParametricKind, min: f64, max: f64, n: u32) -> ParametricWaveform {
        ParametricWaveform {
            kind,
            min,
            max,
            points_per_cycle: n,
            interval_ms: 100,
        }
    }

    #[test]
    fn test_sine_returns_to_center() {
        let steps = sine(&parametric(ParametricKind::Sine, 0.0, 10.0, 8));
        assert_eq!(steps.len(), 8);
        assert!((steps.last().unwrap().value - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_triangle_ends_at_min() {
        let steps = triangle(&parametric(ParametricKind::Triangle, 0.0, 10.0, 4));
        assert!((steps.last().unwrap().value - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_ramp_single_point() {
        let steps = ramp(&parametric(ParametricKind::Ramp, 2.0, 8.0, 1));
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].value, 2.0);
    }

    #[test]
    fn test_square_half_high_half_low() {
        let steps = square(&parametric(ParametricKind::Square, 0.0, 1.0, 4));
        assert_eq!(
            steps.iter().map(|s| s.value).collect::<Vec<_>>(),
            vec![1.0, 1.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_random_walk_stays_within_bounds() {
        let p = RandomWalkWaveform {
            start_value: 5.0,
            max_step_size: 1.0,
            min: 0.0,
            max: 10.0,
            points_per_cycle: 50,
            interval_ms: 20,
        };
        let steps = random_walk(&p, p.start_value);
        assert_eq!(steps.len(), 50);
        assert!(steps.iter().all(|s| s.value >= 0.0 && s.value <= 10.0));
    }

    #[test]
    fn test_constant_when_min_equals_max() {
        let steps = ramp(&parametric(ParametricKind::Ramp, 3.0, 3.0, 5));
        assert!(steps.iter().all(|s| s.value == 3.0));
    }
}

//! Learning-rate schedules
//!
//! The schedule is chosen once when the trainer is built: a fixed rate, the
//! transformer warm-up curve, or a per-step curve loaded from a JSON file.

use crate::error::{Result, StError};
use std::path::Path;

/// Warm-up steps used when a warm-up schedule is requested without a count
pub const DEFAULT_WARMUP_STEPS: u64 = 4000;

/// Schedule as configured, before the model width is known
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    Fixed(f64),
    Warmup { warmup_steps: u64 },
    /// Rate per training step; the last rate is held once the curve ends
    Curve(Vec<f64>),
}

impl ScheduleSpec {
    /// Load a curve from a JSON array of rates
    pub fn load_curve(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StError::Schedule(format!("failed to read {}: {e}", path.display()))
        })?;
        let rates: Vec<f64> = serde_json::from_str(&contents).map_err(|e| {
            StError::Schedule(format!("{} is not a JSON array of rates: {e}", path.display()))
        })?;
        let spec = ScheduleSpec::Curve(rates);
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ScheduleSpec::Fixed(rate) if !(rate.is_finite() && *rate > 0.0) => Err(
                StError::Schedule(format!("fixed rate must be a positive number, got {rate}")),
            ),
            ScheduleSpec::Warmup { warmup_steps: 0 } => Err(StError::Schedule(
                "warm-up schedule needs at least one step".to_string(),
            )),
            ScheduleSpec::Curve(rates) if rates.is_empty() => {
                Err(StError::Schedule("loaded curve is empty".to_string()))
            }
            ScheduleSpec::Curve(rates) if rates.iter().any(|r| !(r.is_finite() && *r >= 0.0)) => {
                Err(StError::Schedule(
                    "loaded curve contains a negative or non-finite rate".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Bind the spec to the attention width it scales with
    pub fn resolve(&self, d_model: usize) -> LrSchedule {
        match self {
            ScheduleSpec::Fixed(rate) => LrSchedule::Fixed(*rate),
            ScheduleSpec::Warmup { warmup_steps } => LrSchedule::Warmup {
                d_model: d_model as f64,
                warmup_steps: *warmup_steps as f64,
            },
            ScheduleSpec::Curve(rates) => LrSchedule::Curve(rates.clone()),
        }
    }
}

/// Schedule ready to produce a rate for any step
#[derive(Debug, Clone, PartialEq)]
pub enum LrSchedule {
    Fixed(f64),
    Warmup { d_model: f64, warmup_steps: f64 },
    Curve(Vec<f64>),
}

impl LrSchedule {
    /// Rate for the zero-based training step
    pub fn rate(&self, step: u64) -> f64 {
        match self {
            LrSchedule::Fixed(rate) => *rate,
            LrSchedule::Warmup {
                d_model,
                warmup_steps,
            } => {
                let s = (step + 1) as f64;
                let arg1 = s.powf(-0.5);
                let arg2 = s * warmup_steps.powf(-1.5);
                d_model.powf(-0.5) * arg1.min(arg2)
            }
            LrSchedule::Curve(rates) => {
                let idx = (step as usize).min(rates.len().saturating_sub(1));
                rates.get(idx).copied().unwrap_or(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_rate_is_constant() {
        let schedule = ScheduleSpec::Fixed(1e-3).resolve(256);
        assert_eq!(schedule.rate(0), 1e-3);
        assert_eq!(schedule.rate(100_000), 1e-3);
    }

    #[test]
    fn test_warmup_peaks_at_warmup_steps() {
        let schedule = ScheduleSpec::Warmup { warmup_steps: 100 }.resolve(256);
        let before = schedule.rate(49);
        let peak = schedule.rate(99);
        let after = schedule.rate(400);
        assert!(before < peak);
        assert!(after < peak);
        // At s == warmup both branches agree: d^-0.5 * warmup^-0.5
        let expected = 256f64.powf(-0.5) * 100f64.powf(-0.5);
        assert!((peak - expected).abs() < 1e-12);
    }

    #[test]
    fn test_curve_holds_last_rate() {
        let schedule = ScheduleSpec::Curve(vec![0.3, 0.2, 0.1]).resolve(16);
        assert_eq!(schedule.rate(0), 0.3);
        assert_eq!(schedule.rate(2), 0.1);
        assert_eq!(schedule.rate(50), 0.1);
    }

    #[test]
    fn test_invalid_specs_rejected() {
        assert!(ScheduleSpec::Fixed(0.0).validate().is_err());
        assert!(ScheduleSpec::Fixed(f64::NAN).validate().is_err());
        assert!(ScheduleSpec::Warmup { warmup_steps: 0 }.validate().is_err());
        assert!(ScheduleSpec::Curve(vec![]).validate().is_err());
        assert!(ScheduleSpec::Curve(vec![0.1, -0.1]).validate().is_err());
    }

    #[test]
    fn test_load_curve_rejects_non_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curve.json");
        std::fs::write(&path, "{\"lr\": 0.1}").unwrap();
        assert!(matches!(
            ScheduleSpec::load_curve(&path),
            Err(StError::Schedule(_))
        ));
    }
}

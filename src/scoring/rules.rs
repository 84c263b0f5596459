//! Threshold and rate-of-change checks
//!
//! Checks run in a fixed order and every bound is strict: a value equal to
//! its threshold never triggers. Rate checks compare a window with the
//! previous window of the same locomotive and are skipped for the first one.

use super::{SignalOutput, SignalSource};
use crate::aggregation::{FeatureLayout, FeatureName, FeatureValue, FeatureVector};
use crate::config::{RuleTargets, ThresholdTable};
use crate::quality::QualityWarning;

/// Individual rule, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleCheck {
    TempMotorMax,
    TempMotorRate,
    CurrentStdMax,
    BatteryMin,
    SpeedJump,
    PressureRange,
}

impl RuleCheck {
    pub const ALL: [RuleCheck; 6] = [
        RuleCheck::TempMotorMax,
        RuleCheck::TempMotorRate,
        RuleCheck::CurrentStdMax,
        RuleCheck::BatteryMin,
        RuleCheck::SpeedJump,
        RuleCheck::PressureRange,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RuleCheck::TempMotorMax => "temp_motor_max",
            RuleCheck::TempMotorRate => "temp_motor_rate_max",
            RuleCheck::CurrentStdMax => "current_std_max",
            RuleCheck::BatteryMin => "battery_min",
            RuleCheck::SpeedJump => "speed_jump_max",
            RuleCheck::PressureRange => "pressure_range",
        }
    }
}

/// A rule target resolved against the run layout
#[derive(Debug, Clone)]
struct Target {
    column: String,
    field: Option<FeatureName>,
}

impl Target {
    fn new(layout: &FeatureLayout, column: &str) -> Self {
        Self {
            column: column.to_string(),
            field: layout.resolve(column),
        }
    }

    fn value(&self, vector: &FeatureVector) -> FeatureValue {
        self.field.map_or(FeatureValue::Missing, |f| vector.get(f))
    }
}

/// Stateless rule evaluator
#[derive(Debug, Clone)]
pub struct RuleScorer {
    thresholds: ThresholdTable,
    motor_temperature: Target,
    current_dispersion: Target,
    battery_voltage: Target,
    pressure: Target,
    speed: Target,
}

impl RuleScorer {
    pub fn new(thresholds: ThresholdTable, targets: &RuleTargets, layout: &FeatureLayout) -> Self {
        Self {
            thresholds,
            motor_temperature: Target::new(layout, &targets.motor_temperature),
            current_dispersion: Target::new(layout, &targets.current_dispersion),
            battery_voltage: Target::new(layout, &targets.battery_voltage),
            pressure: Target::new(layout, &targets.pressure),
            speed: Target::new(layout, &targets.speed),
        }
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    /// Evaluate every enabled check against `vector`.
    ///
    /// `previous` is the preceding window of the same locomotive, if any.
    pub fn evaluate(&self, vector: &FeatureVector, previous: Option<&FeatureVector>) -> SignalOutput {
        let mut out = SignalOutput::new(SignalSource::Rules);
        let t = &self.thresholds;

        for check in RuleCheck::ALL {
            match check {
                RuleCheck::TempMotorMax => {
                    if let Some(max) = t.temp_motor_max {
                        if let Some(v) = self.input(&mut out, check, &self.motor_temperature, vector) {
                            if v > max {
                                flag(&mut out, check.name());
                            }
                        }
                    }
                }
                RuleCheck::TempMotorRate => {
                    if let (Some(max), Some(prev)) = (t.temp_motor_rate_max, previous) {
                        if let Some(rate) = self.rate(&mut out, check, &self.motor_temperature, vector, prev) {
                            if rate > max {
                                flag(&mut out, check.name());
                            }
                        }
                    }
                }
                RuleCheck::CurrentStdMax => {
                    if let Some(max) = t.current_std_max {
                        if let Some(v) = self.input(&mut out, check, &self.current_dispersion, vector) {
                            if v > max {
                                flag(&mut out, check.name());
                            }
                        }
                    }
                }
                RuleCheck::BatteryMin => {
                    if let Some(min) = t.battery_min {
                        if let Some(v) = self.input(&mut out, check, &self.battery_voltage, vector) {
                            if v < min {
                                flag(&mut out, check.name());
                            }
                        }
                    }
                }
                RuleCheck::SpeedJump => {
                    if let (Some(max), Some(prev)) = (t.speed_jump_max, previous) {
                        if let Some(rate) = self.rate(&mut out, check, &self.speed, vector, prev) {
                            if rate > max {
                                flag(&mut out, check.name());
                            }
                        }
                    }
                }
                RuleCheck::PressureRange => {
                    if t.pressure_min.is_none() && t.pressure_max.is_none() {
                        continue;
                    }
                    if let Some(v) = self.input(&mut out, check, &self.pressure, vector) {
                        if t.pressure_min.is_some_and(|lo| v < lo) {
                            flag(&mut out, "pressure_min");
                        } else if t.pressure_max.is_some_and(|hi| v > hi) {
                            flag(&mut out, "pressure_max");
                        }
                    }
                }
            }
        }

        out
    }

    /// Current value of a target, or a skip warning when it is absent
    fn input(
        &self,
        out: &mut SignalOutput,
        check: RuleCheck,
        target: &Target,
        vector: &FeatureVector,
    ) -> Option<f64> {
        let value = target.value(vector).as_f64();
        if value.is_none() {
            out.warn(QualityWarning::RuleSkipped {
                rule: check.name().to_string(),
                field: target.column.clone(),
            });
        }
        value
    }

    /// |Δ| per minute between `previous` and `vector`
    fn rate(
        &self,
        out: &mut SignalOutput,
        check: RuleCheck,
        target: &Target,
        vector: &FeatureVector,
        previous: &FeatureVector,
    ) -> Option<f64> {
        let current = self.input(out, check, target, vector)?;
        // An absent previous value means there is no rate, not a degraded input
        let before = target.value(previous).as_f64()?;
        let minutes = vector.minutes_since(previous);
        if minutes <= 0.0 {
            return None;
        }
        Some((current - before).abs() / minutes)
    }
}

fn flag(out: &mut SignalOutput, check: &str) {
    out.flag(format!("{}:{}", SignalSource::Rules.label_prefix(), check));
}

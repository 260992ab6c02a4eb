//! Control rules binding a set point to its outputs.
//!
//! Evaluation is a pure function of the cache snapshot and the set point, so
//! the logic worker can be tested without threads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::Snapshot;
use crate::config::SetPoint;

pub const ON: f64 = 1.0;
pub const OFF: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRule {
    /// Outputs on at or below `target - hysteresis`, off at or above
    /// `target + hysteresis`, unchanged in between.
    Heat { hysteresis: f64 },
    /// Mirror of `Heat`.
    Cool { hysteresis: f64 },
    /// Drives analog outputs to the target once the input strays further than
    /// `deadband` from it.
    Track { deadband: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Drive(f64),
    Hold,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleEvaluationError {
    #[error("set point '{set_point}': no reading for input '{point_id}' yet")]
    MissingInput { set_point: String, point_id: String },
    #[error("set point '{set_point}': input '{point_id}' is not finite ({value})")]
    NonFiniteInput {
        set_point: String,
        point_id: String,
        value: f64,
    },
    #[error("set point '{set_point}': band {band} must be finite and non-negative")]
    InvalidBand { set_point: String, band: f64 },
}

impl ControlRule {
    pub fn band(&self) -> f64 {
        match *self {
            ControlRule::Heat { hysteresis } | ControlRule::Cool { hysteresis } => hysteresis,
            ControlRule::Track { deadband } => deadband,
        }
    }

    pub fn decide(&self, target: f64, measured: f64) -> Decision {
        match *self {
            ControlRule::Heat { hysteresis } => {
                if measured <= target - hysteresis {
                    Decision::Drive(ON)
                } else if measured >= target + hysteresis {
                    Decision::Drive(OFF)
                } else {
                    Decision::Hold
                }
            }
            ControlRule::Cool { hysteresis } => {
                if measured >= target + hysteresis {
                    Decision::Drive(ON)
                } else if measured <= target - hysteresis {
                    Decision::Drive(OFF)
                } else {
                    Decision::Hold
                }
            }
            ControlRule::Track { deadband } => {
                if (measured - target).abs() > deadband {
                    Decision::Drive(target)
                } else {
                    Decision::Hold
                }
            }
        }
    }
}

pub fn evaluate(snapshot: &Snapshot, set_point: &SetPoint) -> Result<Decision, RuleEvaluationError> {
    let band = set_point.rule.band();
    if !band.is_finite() || band < 0.0 {
        return Err(RuleEvaluationError::InvalidBand {
            set_point: set_point.name.clone(),
            band,
        });
    }

    let measured =
        snapshot
            .value(&set_point.input)
            .ok_or_else(|| RuleEvaluationError::MissingInput {
                set_point: set_point.name.clone(),
                point_id: set_point.input.clone(),
            })?;

    if !measured.is_finite() {
        return Err(RuleEvaluationError::NonFiniteInput {
            set_point: set_point.name.clone(),
            point_id: set_point.input.clone(),
            value: measured,
        });
    }

    Ok(set_point.rule.decide(set_point.target, measured))
}

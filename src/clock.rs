use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::error::{ToolError, ToolResult};

/// Simulation clock converting elapsed real time into simulated time.
#[derive(Debug, Clone, Serialize)]
pub struct SimClock {
    simulated_time: f64,
    acceleration: f64,
    max_acceleration: f64,
    real_epoch: DateTime<Utc>,
    /// Simulated time queued by `nudge`, consumed on the next advance
    #[serde(skip)]
    nudged: f64,
}

impl SimClock {
    pub fn new(acceleration: f64, max_acceleration: f64) -> ToolResult<Self> {
        let max_acceleration = if max_acceleration.is_finite() && max_acceleration > 0.0 {
            max_acceleration
        } else {
            f64::MAX
        };
        let mut clock = Self {
            simulated_time: 0.0,
            acceleration: 1.0,
            max_acceleration,
            real_epoch: Utc::now(),
            nudged: 0.0,
        };
        clock.set_acceleration(acceleration)?;
        Ok(clock)
    }

    pub fn simulated_time(&self) -> f64 {
        self.simulated_time
    }

    pub fn acceleration(&self) -> f64 {
        self.acceleration
    }

    pub fn real_epoch(&self) -> DateTime<Utc> {
        self.real_epoch
    }

    /// Seconds of wall-clock time since the clock was created
    pub fn real_elapsed_secs(&self) -> f64 {
        (Utc::now() - self.real_epoch).num_milliseconds() as f64 / 1000.0
    }

    /// Change the acceleration factor. Non-positive or non-finite factors are
    /// rejected; factors above the configured maximum are clamped.
    /// Returns the factor actually applied.
    pub fn set_acceleration(&mut self, factor: f64) -> ToolResult<f64> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(ToolError::Validation(format!(
                "acceleration must be a positive number, got {}",
                factor
            )));
        }
        self.acceleration = factor.min(self.max_acceleration);
        Ok(self.acceleration)
    }

    /// Queue extra simulated time for the next advance. Negative or
    /// non-finite amounts are ignored.
    pub fn nudge(&mut self, amount: f64) {
        if amount.is_finite() && amount > 0.0 {
            self.nudged += amount;
        }
    }

    /// Advance by an elapsed real interval; returns the simulated delta,
    /// including any nudged time.
    pub fn advance(&mut self, real_elapsed: Duration) -> f64 {
        let delta = real_elapsed.as_secs_f64() * self.acceleration + self.nudged;
        self.nudged = 0.0;
        self.simulated_time += delta;
        delta
    }

    /// Advance by simulated time directly, bypassing acceleration.
    pub fn advance_simulated(&mut self, delta: f64) -> f64 {
        let delta = if delta.is_finite() && delta > 0.0 { delta } else { 0.0 };
        let delta = delta + self.nudged;
        self.nudged = 0.0;
        self.simulated_time += delta;
        delta
    }
}

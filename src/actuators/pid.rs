/*
 * Gaia - greenhouse automation engine
 * Copyright (c) 2023-2026  Gaia Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::time::Instant;

pub const DEFAULT_KP: f64 = 15.0;
pub const DEFAULT_KI: f64 = 0.5;
pub const DEFAULT_KD: f64 = 1.0;
pub const DEFAULT_OUTPUT_LIMITS: (f64, f64) = (-100.0, 100.0);

/// A PID controller with a hysteresis dead band around the setpoint.
///
/// Inside the band the controller only keeps driving while its previous
/// output still pushes the value toward the setpoint from the same side;
/// once the value has crossed over, the output drops to zero and stays
/// there until the value leaves the band again. This prevents oscillation
/// around the setpoint. With `hysteresis == 0` this is a plain PID.
#[derive(Debug)]
pub struct HystericalPID {
    target: f64,
    hysteresis: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    min_output: f64,
    max_output: f64,
    integral: f64,
    last_error: Option<f64>,
    last_update: Option<Instant>,
    last_output: f64,
}

impl HystericalPID {
    pub fn new(kp: f64, ki: f64, kd: f64, output_limits: (f64, f64)) -> Self {
        Self {
            target: 0.0,
            hysteresis: 0.0,
            kp,
            ki,
            kd,
            min_output: output_limits.0,
            max_output: output_limits.1,
            integral: 0.0,
            last_error: None,
            last_update: None,
            last_output: 0.0,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    pub fn hysteresis(&self) -> f64 {
        self.hysteresis
    }

    pub fn set_hysteresis(&mut self, hysteresis: f64) {
        self.hysteresis = hysteresis;
    }

    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    /// Clears the controller state. Target and hysteresis are kept.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
        self.last_update = None;
        self.last_output = 0.0;
    }

    /// Feeds a new measurement and returns the clamped control output.
    pub fn update_pid(&mut self, value: f64) -> f64 {
        let now = Instant::now();
        let dt = self
            .last_update
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(1.0)
            .max(1e-6);
        self.last_update = Some(now);
        self.update_with_dt(value, dt)
    }

    /// The time-explicit variant of [`Self::update_pid`].
    pub fn update_with_dt(&mut self, value: f64, dt: f64) -> f64 {
        let error = self.target - value;
        if self.hysteresis > 0.0 && error.abs() <= self.hysteresis {
            let same_direction = (error > 0.0 && self.last_output > 0.0)
                || (error < 0.0 && self.last_output < 0.0);
            if !same_direction {
                // The value crossed the setpoint; stay quiet until it
                // leaves the dead band.
                self.integral = 0.0;
                self.last_error = Some(error);
                self.last_output = 0.0;
                return 0.0;
            }
        }
        self.integral += error * dt;
        self.clamp_integral();
        let derivative = self
            .last_error
            .map(|last| (error - last) / dt)
            .unwrap_or(0.0);
        self.last_error = Some(error);
        let output = self.kp * error + self.ki * self.integral + self.kd * derivative;
        self.last_output = output.clamp(self.min_output, self.max_output);
        self.last_output
    }

    /// Keeps `ki * integral` within the output limits so a long excursion
    /// does not wind the integral term up.
    fn clamp_integral(&mut self) {
        if self.ki == 0.0 {
            return;
        }
        let bound = self.max_output.abs().max(self.min_output.abs()) / self.ki;
        self.integral = self.integral.clamp(-bound, bound);
    }

    #[cfg(test)]
    pub(crate) fn set_last_output(&mut self, output: f64) {
        self.last_output = output;
    }
}

impl Default for HystericalPID {
    fn default() -> Self {
        Self::new(DEFAULT_KP, DEFAULT_KI, DEFAULT_KD, DEFAULT_OUTPUT_LIMITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: f64 = 42.0;
    const HYSTERESIS: f64 = 2.5;

    fn pid() -> HystericalPID {
        let mut pid = HystericalPID::default();
        pid.set_target(TARGET);
        pid.set_hysteresis(HYSTERESIS);
        pid
    }

    #[test]
    fn below_target_out_of_hysteresis_range() {
        let value = TARGET - 2.0 * HYSTERESIS;
        for last_output in [-1.0, 0.0, 1.0] {
            let mut pid = pid();
            pid.set_last_output(last_output);
            assert!(pid.update_with_dt(value, 1.0) > 0.0);
        }
    }

    #[test]
    fn below_target_in_hysteresis_range() {
        let value = TARGET - 0.5 * HYSTERESIS;
        for (last_output, driving) in [(-1.0, false), (0.0, false), (1.0, true)] {
            let mut pid = pid();
            pid.set_last_output(last_output);
            let output = pid.update_with_dt(value, 1.0);
            if driving {
                assert!(output > 0.0);
            } else {
                assert_eq!(output, 0.0);
            }
        }
    }

    #[test]
    fn above_target_in_hysteresis_range() {
        let value = TARGET + 0.5 * HYSTERESIS;
        for (last_output, driving) in [(-1.0, true), (0.0, false), (1.0, false)] {
            let mut pid = pid();
            pid.set_last_output(last_output);
            let output = pid.update_with_dt(value, 1.0);
            if driving {
                assert!(output < 0.0);
            } else {
                assert_eq!(output, 0.0);
            }
        }
    }

    #[test]
    fn above_target_out_of_hysteresis_range() {
        let value = TARGET + 2.0 * HYSTERESIS;
        for last_output in [-1.0, 0.0, 1.0] {
            let mut pid = pid();
            pid.set_last_output(last_output);
            assert!(pid.update_with_dt(value, 1.0) < 0.0);
        }
    }

    #[test]
    fn zero_hysteresis_is_a_plain_pid() {
        let mut pid = HystericalPID::default();
        pid.set_target(10.0);
        // within what would be a typical dead band
        assert!(pid.update_with_dt(9.9, 1.0) > 0.0);
        assert!(pid.update_with_dt(10.1, 1.0) < 0.0);
    }

    #[test]
    fn output_is_clamped() {
        let mut pid = pid();
        assert_eq!(pid.update_with_dt(TARGET - 1000.0, 1.0), 100.0);
        pid.reset();
        assert_eq!(pid.update_with_dt(TARGET + 1000.0, 1.0), -100.0);
    }

    #[test]
    fn integral_does_not_wind_up() {
        let mut pid = pid();
        for _ in 0..1000 {
            pid.update_with_dt(TARGET - 50.0, 1.0);
        }
        // after the excursion ends, the output recovers in a bounded number
        // of steps instead of staying pinned by a wound-up integral
        let mut output = pid.update_with_dt(TARGET + 50.0, 1.0);
        for _ in 0..500 {
            if output < 0.0 {
                break;
            }
            output = pid.update_with_dt(TARGET + 50.0, 1.0);
        }
        assert!(output < 0.0);
    }

    #[test]
    fn reset_clears_state() {
        let mut pid = pid();
        pid.update_with_dt(TARGET - 10.0, 1.0);
        pid.reset();
        assert_eq!(pid.last_output(), 0.0);
        assert_eq!(pid.target(), TARGET);
        assert_eq!(pid.hysteresis(), HYSTERESIS);
    }
}

//! Gate and pulse arithmetic for position-compare fly scans.
//!
//! Everything here is pure computation: a requested scan line plus the
//! active detector exposure settings are turned into the register values
//! the position-compare unit needs. Hardware readbacks feed back in only
//! through [`required_speed`], which re-derives the motor velocity from
//! the pulse step the device actually accepted.

use crate::error::FlyScanError;
use serde::{Deserialize, Serialize};

/// Collection times above this many seconds overflow the pulse-width
/// register at millisecond resolution, forcing the seconds timebase.
pub const MS_RANGE_LIMIT_S: f64 = 214.0;

/// Raw register units shaved off a pulse width (and delay) so it never
/// spans the full gap between pulses; the comparator cannot re-arm on a
/// zero-length low phase.
pub const PULSE_TRIM: f64 = 0.0002;

/// Detectors sharing one gate must agree on exposure to within this.
pub const COLLECTION_TIME_TOLERANCE_S: f64 = 1e-6;

/// Timebase the device interprets pulse registers in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    /// Device units per second.
    pub fn scale(self) -> f64 {
        match self {
            TimeUnit::Milliseconds => 1000.0,
            TimeUnit::Seconds => 1.0,
        }
    }

    /// Encoding of the TIME_UNIT register.
    pub fn register_value(self) -> f64 {
        match self {
            TimeUnit::Milliseconds => 0.0,
            TimeUnit::Seconds => 1.0,
        }
    }
}

/// What drives pulse emission while the gate is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PulseRoute {
    /// Pulses tick on the device clock
    Time,
    /// Pulses fire on encoder position thresholds
    Position,
    /// Pulses arrive from an external source; only the gate is programmed
    External,
}

/// Scan direction along the axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }

    /// Encoding of the DIRECTION register.
    pub fn register_value(self) -> f64 {
        match self {
            Direction::Positive => 0.0,
            Direction::Negative => 1.0,
        }
    }
}

/// One requested constant-velocity scan line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSpec {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub trigger_period: f64,
    pub route: PulseRoute,
}

impl ScanSpec {
    pub fn new(
        start: f64,
        end: f64,
        step: f64,
        trigger_period: f64,
        route: PulseRoute,
    ) -> Result<Self, FlyScanError> {
        if step == 0.0 || !step.is_finite() {
            return Err(FlyScanError::Config(format!("Scan step must be non-zero, got {step}")));
        }
        if trigger_period <= 0.0 || !trigger_period.is_finite() {
            return Err(FlyScanError::Config(format!(
                "Trigger period must be positive, got {trigger_period}"
            )));
        }
        if !start.is_finite() || !end.is_finite() {
            return Err(FlyScanError::Config(format!(
                "Scan bounds must be finite, got {start}..{end}"
            )));
        }
        Ok(Self {
            start,
            end,
            step,
            trigger_period,
            route,
        })
    }

    /// Trigger count for this line: floor(|end-start| / |step|) + 1.
    pub fn number_of_triggers(&self) -> u64 {
        ((self.end - self.start).abs() / self.step.abs()).floor() as u64 + 1
    }

    pub fn direction(&self) -> Direction {
        if self.end >= self.start {
            Direction::Positive
        } else {
            Direction::Negative
        }
    }

    /// Distance the axis travels during one detector exposure at the
    /// line's nominal speed.
    pub fn exposure_distance(&self, collection_time: f64) -> f64 {
        self.step.abs() * (collection_time / self.trigger_period)
    }

    /// Nominal constant velocity for the line.
    pub fn nominal_speed(&self) -> f64 {
        self.step.abs() / self.trigger_period
    }
}

/// Exposure settings of one detector riding the gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorProfile {
    /// Exposure per trigger, seconds
    pub collection_time: f64,
    /// Extra run-up time the detector needs before the first trigger
    pub min_accel_time: Option<f64>,
}

impl DetectorProfile {
    pub fn new(collection_time: f64) -> Self {
        Self {
            collection_time,
            min_accel_time: None,
        }
    }
}

/// Register values describing one armed gate. Derived deterministically
/// from the scan line and detector profiles; a new line recomputes from
/// scratch, the values are never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateParameters {
    /// Gate opening position, axis units
    pub gate_start: f64,
    /// Gate extent, axis units
    pub gate_width: f64,
    /// Pulse period, device units (timebase or axis units per route)
    pub pulse_step: f64,
    /// Pulse high time, device units
    pub pulse_width: f64,
    /// Delay from gate open to first pulse, device units
    pub pulse_delay: f64,
    pub direction: Direction,
    pub time_unit: TimeUnit,
    pub num_gates: u64,
    /// Pulse cap programmed into PULSE_MAX
    pub triggers: u64,
}

/// Pre-move speed/run-up decision for one line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelerationBudget {
    pub required_speed: f64,
    pub accel_distance: f64,
}

impl AccelerationBudget {
    /// Distance is the larger of the kinematic estimate and the
    /// configured floor, extended when a detector asks for more run-up
    /// time than the motor needs to reach velocity.
    pub fn compute(
        required_speed: f64,
        time_to_velocity: f64,
        min_distance: f64,
        detectors: &[DetectorProfile],
    ) -> Self {
        let extension = detectors
            .iter()
            .filter_map(|d| d.min_accel_time)
            .fold(0.0_f64, f64::max);
        let runup_time = time_to_velocity.max(extension);
        let kinematic = 0.5 * required_speed * time_to_velocity
            + required_speed * (runup_time - time_to_velocity);
        Self {
            required_speed,
            accel_distance: kinematic.max(min_distance),
        }
    }
}

/// Motor trajectory for one line: run-up start, run-down end and a wall
/// time estimate including both ramps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovePlan {
    pub gate: GateParameters,
    pub budget: AccelerationBudget,
    /// Pre-move target: run-up distance before the gate opens
    pub prestart: f64,
    /// Move target: run-down distance past the gate
    pub overrun: f64,
    pub total_time: f64,
}

impl MovePlan {
    pub fn new(gate: GateParameters, budget: AccelerationBudget, scan: &ScanSpec) -> Self {
        let sign = gate.direction.sign();
        let gate_end = gate.gate_start + sign * gate.gate_width;
        let prestart = gate.gate_start - sign * budget.accel_distance;
        let overrun = gate_end + sign * budget.accel_distance;
        let ramp_time = if budget.required_speed > 0.0 {
            2.0 * budget.accel_distance / budget.required_speed
        } else {
            0.0
        };
        let total_time = gate.triggers as f64 * scan.trigger_period + 2.0 * ramp_time;
        Self {
            gate,
            budget,
            prestart,
            overrun,
            total_time,
        }
    }
}

/// Largest collection time over the active detectors, failing fast when
/// they disagree: one gate cannot serve heterogeneous exposures.
pub fn resolve_collection_time(detectors: &[DetectorProfile]) -> Result<f64, FlyScanError> {
    let mut times = detectors.iter().map(|d| d.collection_time);
    let first = times
        .next()
        .ok_or_else(|| FlyScanError::Config("No active detectors".to_string()))?;
    let mut max = first;
    for time in times {
        if (time - first).abs() > COLLECTION_TIME_TOLERANCE_S {
            return Err(FlyScanError::Config(format!(
                "Detector collection times disagree: {first} vs {time}"
            )));
        }
        max = max.max(time);
    }
    if max <= 0.0 {
        return Err(FlyScanError::Config(format!(
            "Collection time must be positive, got {max}"
        )));
    }
    Ok(max)
}

/// Milliseconds when they fit, for resolution; seconds past the register
/// range limit.
pub fn select_time_unit(max_collection_s: f64) -> TimeUnit {
    if max_collection_s > MS_RANGE_LIMIT_S {
        TimeUnit::Seconds
    } else {
        TimeUnit::Milliseconds
    }
}

/// Turn a scan line and detector exposures into gate/pulse registers.
pub fn compute_gate_parameters(
    scan: &ScanSpec,
    detectors: &[DetectorProfile],
) -> Result<GateParameters, FlyScanError> {
    let triggers = scan.number_of_triggers();
    let collection = resolve_collection_time(detectors)?;
    if collection > scan.trigger_period + COLLECTION_TIME_TOLERANCE_S {
        return Err(FlyScanError::Config(format!(
            "Collection time {collection}s does not fit trigger period {}s",
            scan.trigger_period
        )));
    }

    let time_unit = select_time_unit(collection);
    let scale = time_unit.scale();
    let step_size = scan.step.abs();
    let direction = scan.direction();
    let exposure_distance = scan.exposure_distance(collection);

    let (pulse_step, pulse_width, pulse_delay) = match scan.route {
        PulseRoute::Time => {
            let nominal_step = scan.trigger_period * scale;
            let capture_delay = 0.5 * collection * scale;
            if triggers > 1 {
                (
                    nominal_step,
                    nominal_step - PULSE_TRIM,
                    capture_delay.min(nominal_step - PULSE_TRIM),
                )
            } else {
                // One pulse only: nothing follows it to borrow time
                // from, so widen the step to hold the full exposure.
                (collection * scale + PULSE_TRIM, collection * scale, capture_delay)
            }
        }
        PulseRoute::Position => {
            let capture_delay = 0.5 * exposure_distance;
            if triggers > 1 {
                (
                    step_size,
                    step_size - PULSE_TRIM,
                    capture_delay.min(step_size - PULSE_TRIM),
                )
            } else {
                (exposure_distance + PULSE_TRIM, exposure_distance, capture_delay)
            }
        }
        PulseRoute::External => (0.0, 0.0, 0.0),
    };

    let gate_width = match scan.route {
        // Conservative conversion of the temporal window back to axis
        // units at nominal speed; the gate stays open past the last pulse.
        PulseRoute::Time => {
            let window_s = (pulse_delay + pulse_step * triggers as f64 + pulse_width) / scale;
            window_s * scan.nominal_speed()
        }
        PulseRoute::Position | PulseRoute::External => {
            step_size * (triggers - 1) as f64 + exposure_distance
        }
    };

    // Open half an exposure early so the first capture is centred on the
    // first point, not one half-window late.
    let gate_start = scan.start - direction.sign() * 0.5 * exposure_distance;

    Ok(GateParameters {
        gate_start,
        gate_width,
        pulse_step,
        pulse_width,
        pulse_delay,
        direction,
        time_unit,
        num_gates: 1,
        triggers,
    })
}

/// Constant velocity implied by the pulse step the device reported back.
///
/// Motion must follow the hardware's actual configuration, not the
/// requested one, or the trigger count and the travelled distance drift
/// apart over a long line.
pub fn required_speed(scan: &ScanSpec, pulse_step_rbv: f64, time_unit: TimeUnit) -> f64 {
    match scan.route {
        PulseRoute::Time => scan.step.abs() / (pulse_step_rbv / time_unit.scale()),
        PulseRoute::Position => pulse_step_rbv / scan.trigger_period,
        PulseRoute::External => scan.nominal_speed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(start: f64, end: f64, step: f64, period: f64) -> ScanSpec {
        ScanSpec::new(start, end, step, period, PulseRoute::Time).unwrap()
    }

    #[test]
    fn test_trigger_count_formula() {
        assert_eq!(line(0.0, 9.0, 1.0, 0.1).number_of_triggers(), 10);
        assert_eq!(line(0.0, 0.0, 1.0, 0.1).number_of_triggers(), 1);
        assert_eq!(line(9.0, 0.0, 1.0, 0.1).number_of_triggers(), 10);
        assert_eq!(line(0.0, 1.0, 0.3, 0.1).number_of_triggers(), 4);
        assert_eq!(line(-2.0, 2.0, 0.5, 0.1).number_of_triggers(), 9);
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(ScanSpec::new(0.0, 1.0, 0.0, 0.1, PulseRoute::Time).is_err());
        assert!(ScanSpec::new(0.0, 1.0, f64::NAN, 0.1, PulseRoute::Time).is_err());
    }

    #[test]
    fn test_time_unit_boundary() {
        assert_eq!(select_time_unit(214.0), TimeUnit::Milliseconds);
        assert_eq!(select_time_unit(214.0001), TimeUnit::Seconds);
        assert_eq!(select_time_unit(0.1), TimeUnit::Milliseconds);
    }

    #[test]
    fn test_collection_time_agreement() {
        let agreeing = [
            DetectorProfile::new(0.1),
            DetectorProfile::new(0.1 + 1e-9),
        ];
        assert!((resolve_collection_time(&agreeing).unwrap() - 0.1).abs() < 1e-8);

        let disagreeing = [DetectorProfile::new(0.1), DetectorProfile::new(0.2)];
        assert!(resolve_collection_time(&disagreeing).is_err());

        assert!(resolve_collection_time(&[]).is_err());
    }

    #[test]
    fn test_ten_point_millisecond_line() {
        let scan = line(0.0, 9.0, 1.0, 0.1);
        let params =
            compute_gate_parameters(&scan, &[DetectorProfile::new(0.1)]).unwrap();

        assert_eq!(params.triggers, 10);
        assert_eq!(params.time_unit, TimeUnit::Milliseconds);
        assert_eq!(params.pulse_step, 100.0);
        assert_eq!(params.pulse_width, 100.0 - PULSE_TRIM);
        assert_eq!(params.pulse_delay, 50.0);
        assert_eq!(params.direction, Direction::Positive);
        assert_eq!(params.num_gates, 1);
        // Exposure fills the whole period, so the gate opens half a step early
        assert_eq!(params.gate_start, -0.5);
    }

    #[test]
    fn test_single_trigger_widens_pulse_step() {
        let scan = line(0.0, 0.0, 1.0, 0.1);
        let params =
            compute_gate_parameters(&scan, &[DetectorProfile::new(0.05)]).unwrap();

        assert_eq!(params.triggers, 1);
        // Widened past the exposure instead of trimmed below the period
        assert_eq!(params.pulse_width, 50.0);
        assert_eq!(params.pulse_step, 50.0 + PULSE_TRIM);
        assert!(params.pulse_step > params.pulse_width);
    }

    #[test]
    fn test_exposure_must_fit_period() {
        let scan = line(0.0, 9.0, 1.0, 0.1);
        assert!(compute_gate_parameters(&scan, &[DetectorProfile::new(0.2)]).is_err());
    }

    #[test]
    fn test_negative_direction_gate_start() {
        let scan = line(9.0, 0.0, 1.0, 0.1);
        let params =
            compute_gate_parameters(&scan, &[DetectorProfile::new(0.1)]).unwrap();
        assert_eq!(params.direction, Direction::Negative);
        // Offset opposite to motion: above the start for a falling scan
        assert_eq!(params.gate_start, 9.5);
    }

    #[test]
    fn test_position_route_registers_in_axis_units() {
        let scan = ScanSpec::new(0.0, 9.0, 1.0, 0.1, PulseRoute::Position).unwrap();
        let params =
            compute_gate_parameters(&scan, &[DetectorProfile::new(0.1)]).unwrap();
        assert_eq!(params.pulse_step, 1.0);
        assert_eq!(params.pulse_width, 1.0 - PULSE_TRIM);
        assert_eq!(params.gate_width, 10.0);
    }

    #[test]
    fn test_accel_budget_honours_minimum() {
        // Kinematic estimate: 0.5 * 10 * 0.01 = 0.05, below the floor
        let budget = AccelerationBudget::compute(10.0, 0.01, 0.5, &[]);
        assert_eq!(budget.accel_distance, 0.5);

        // And the move plan starts a full floor-width before the gate
        let scan = line(0.0, 9.0, 1.0, 0.1);
        let gate = compute_gate_parameters(&scan, &[DetectorProfile::new(0.1)]).unwrap();
        let plan = MovePlan::new(gate, budget, &scan);
        assert_eq!(plan.prestart, -0.5 - 0.5);
    }

    #[test]
    fn test_accel_budget_kinematic_when_larger() {
        let budget = AccelerationBudget::compute(10.0, 2.0, 0.5, &[]);
        assert_eq!(budget.accel_distance, 10.0);
    }

    #[test]
    fn test_detector_extension_stretches_runup() {
        let detectors = [DetectorProfile {
            collection_time: 0.1,
            min_accel_time: Some(3.0),
        }];
        let budget = AccelerationBudget::compute(10.0, 2.0, 0.5, &detectors);
        // 0.5*10*2 for the ramp plus 10*(3-2) held at speed
        assert_eq!(budget.accel_distance, 20.0);
    }

    #[test]
    fn test_speed_rederived_from_readback() {
        let scan = line(0.0, 9.0, 1.0, 0.1);
        assert_eq!(scan.nominal_speed(), 10.0);
        // Device rounded the step to 100.5 ms: speed follows the readback
        let speed = required_speed(&scan, 100.5, TimeUnit::Milliseconds);
        assert!((speed - 1.0 / 0.1005).abs() < 1e-9);

        let pos = ScanSpec::new(0.0, 9.0, 1.0, 0.1, PulseRoute::Position).unwrap();
        let speed = required_speed(&pos, 1.002, TimeUnit::Milliseconds);
        assert!((speed - 10.02).abs() < 1e-9);
    }
}

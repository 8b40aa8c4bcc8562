//! Typed access to the position-compare unit's register map.
//!
//! Every operation is a synchronous get/put against a named record via
//! the channel registry. Timing registers carry paired `:RBV` readbacks
//! and are written through [`ZebraDevice::write_checked`], which fails
//! the scan-line setup when the hardware did not accept the value it was
//! given; a silently rounded register would corrupt the trigger count
//! downstream.

use crate::ca::{ChannelRegistry, PvChannel};
use crate::error::FlyScanError;
use crate::timing::{Direction, GateParameters, TimeUnit};
use log::debug;
use std::sync::Arc;

/// Logical registers of the position-compare block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    ArmSource,
    GateSource,
    PulseSource,
    EncoderSelect,
    Direction,
    CaptureBitfield,
    TimeUnit,
    GateStart,
    GateWidth,
    GateNumGates,
    PulseStep,
    PulseWidth,
    PulseDelay,
    PulseMax,
    Arm,
    Disarm,
    Reset,
    ArmedStatus,
    PointsDownloaded,
}

impl Reg {
    pub fn suffix(self) -> &'static str {
        match self {
            Reg::ArmSource => "PC_ARM_SEL",
            Reg::GateSource => "PC_GATE_SEL",
            Reg::PulseSource => "PC_PULSE_SEL",
            Reg::EncoderSelect => "PC_ENC",
            Reg::Direction => "PC_DIR",
            Reg::CaptureBitfield => "PC_BIT_CAP",
            Reg::TimeUnit => "PC_TSPRE",
            Reg::GateStart => "PC_GATE_START",
            Reg::GateWidth => "PC_GATE_WID",
            Reg::GateNumGates => "PC_GATE_NGATE",
            Reg::PulseStep => "PC_PULSE_STEP",
            Reg::PulseWidth => "PC_PULSE_WID",
            Reg::PulseDelay => "PC_PULSE_DLY",
            Reg::PulseMax => "PC_PULSE_MAX",
            Reg::Arm => "PC_ARM",
            Reg::Disarm => "PC_DISARM",
            Reg::Reset => "SYS_RESET.PROC",
            Reg::ArmedStatus => "PC_ARM_OUT",
            Reg::PointsDownloaded => "PC_NUM_DOWN",
        }
    }

    /// Timing registers carry a paired readback record.
    pub fn has_readback(self) -> bool {
        matches!(
            self,
            Reg::GateStart
                | Reg::GateWidth
                | Reg::GateNumGates
                | Reg::PulseStep
                | Reg::PulseWidth
                | Reg::PulseDelay
                | Reg::PulseMax
        )
    }
}

/// Source feeding the arm input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmSource {
    Soft = 0,
    External = 1,
}

/// Source opening and closing the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSource {
    Position = 0,
    Time = 1,
    External = 2,
}

/// Source clocking pulses while the gate is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseSource {
    Position = 0,
    Time = 1,
    External = 2,
}

/// Encoder input compared against the gate/pulse thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    Enc1 = 0,
    Enc2 = 1,
    Enc3 = 2,
    Enc4 = 3,
}

/// One hardware capture source: its waveform record and its bit in the
/// capture-enable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureSource {
    Enc1,
    Enc2,
    Enc3,
    Enc4,
    Time,
}

impl CaptureSource {
    pub fn bit(self) -> u32 {
        match self {
            CaptureSource::Enc1 => 1 << 0,
            CaptureSource::Enc2 => 1 << 1,
            CaptureSource::Enc3 => 1 << 2,
            CaptureSource::Enc4 => 1 << 3,
            CaptureSource::Time => 1 << 4,
        }
    }

    pub fn waveform_suffix(self) -> &'static str {
        match self {
            CaptureSource::Enc1 => "PC_ENC1",
            CaptureSource::Enc2 => "PC_ENC2",
            CaptureSource::Enc3 => "PC_ENC3",
            CaptureSource::Enc4 => "PC_ENC4",
            CaptureSource::Time => "PC_TIME",
        }
    }

    /// Logical capture-channel index, as handed to the fan-out: encoders
    /// 1-4 on indices 0-3, elapsed time on 4.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(CaptureSource::Enc1),
            1 => Some(CaptureSource::Enc2),
            2 => Some(CaptureSource::Enc3),
            3 => Some(CaptureSource::Enc4),
            4 => Some(CaptureSource::Time),
            _ => None,
        }
    }
}

/// Canonical capture-enable bit field.
///
/// The hardware manual leaves the register width ambiguous; this type
/// fixes it at 32 bits with the [`CaptureSource::bit`] mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureMask(u32);

impl CaptureMask {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, source: CaptureSource) -> Self {
        self.0 |= source.bit();
        self
    }

    pub fn contains(self, source: CaptureSource) -> bool {
        self.0 & source.bit() != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Mode/source selects, written as a block before any timing register.
#[derive(Debug, Clone, Copy)]
pub struct SourceSettings {
    pub arm_source: ArmSource,
    pub gate_source: GateSource,
    pub pulse_source: PulseSource,
    pub encoder: Encoder,
    pub direction: Direction,
    pub capture: CaptureMask,
    pub time_unit: TimeUnit,
}

/// Readbacks gathered while applying timing registers.
#[derive(Debug, Clone, Copy)]
pub struct TimingReadback {
    /// What the hardware actually accepted for the pulse step; motion
    /// speed is re-derived from this.
    pub pulse_step: f64,
}

/// Accept a readback iff it sits within an absolute tolerance of the
/// requested value; the boundary itself passes.
pub fn verify(requested: f64, readback: f64, tolerance: f64) -> bool {
    (requested - readback).abs() <= tolerance
}

/// One position-compare unit, addressed through a PV prefix.
pub struct ZebraDevice {
    registry: Arc<ChannelRegistry>,
    prefix: String,
    readback_tolerance: f64,
}

impl ZebraDevice {
    pub fn new(registry: Arc<ChannelRegistry>, prefix: &str, readback_tolerance: f64) -> Self {
        Self {
            registry,
            prefix: prefix.to_string(),
            readback_tolerance,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn channel(&self, reg: Reg) -> Result<Arc<PvChannel>, FlyScanError> {
        self.registry
            .channel(&format!("{}:{}", self.prefix, reg.suffix()))
    }

    fn readback_channel(&self, reg: Reg) -> Result<Arc<PvChannel>, FlyScanError> {
        self.registry
            .channel(&format!("{}:{}:RBV", self.prefix, reg.suffix()))
    }

    pub fn read(&self, reg: Reg) -> Result<f64, FlyScanError> {
        self.channel(reg)?.get()
    }

    pub fn write(&self, reg: Reg, value: f64) -> Result<(), FlyScanError> {
        self.channel(reg)?.put(value)
    }

    /// Write a timing register and confirm it via the paired readback.
    pub fn write_checked(&self, reg: Reg, value: f64) -> Result<f64, FlyScanError> {
        self.channel(reg)?.put(value)?;
        let readback = self.readback_channel(reg)?.get()?;
        if !verify(value, readback, self.readback_tolerance) {
            return Err(FlyScanError::Readback {
                register: reg.suffix(),
                requested: value,
                actual: readback,
                tolerance: self.readback_tolerance,
            });
        }
        Ok(readback)
    }

    /// Program the mode/source selects.
    ///
    /// Must run before [`apply_timing`](Self::apply_timing) within one
    /// setup: the unit only validates cross-register consistency once
    /// its sources are fixed.
    pub fn apply_sources(&self, sources: &SourceSettings) -> Result<(), FlyScanError> {
        self.write(Reg::ArmSource, sources.arm_source as i32 as f64)?;
        self.write(Reg::GateSource, sources.gate_source as i32 as f64)?;
        self.write(Reg::PulseSource, sources.pulse_source as i32 as f64)?;
        self.write(Reg::EncoderSelect, sources.encoder as i32 as f64)?;
        self.write(Reg::Direction, sources.direction.register_value())?;
        self.write(Reg::CaptureBitfield, sources.capture.bits() as f64)?;
        self.write(Reg::TimeUnit, sources.time_unit.register_value())?;
        debug!("Sources programmed on {}", self.prefix);
        Ok(())
    }

    /// Program gate and pulse timing, verifying each register.
    pub fn apply_timing(&self, gate: &GateParameters) -> Result<TimingReadback, FlyScanError> {
        self.write_checked(Reg::GateStart, gate.gate_start)?;
        self.write_checked(Reg::GateWidth, gate.gate_width)?;
        self.write_checked(Reg::GateNumGates, gate.num_gates as f64)?;
        let pulse_step = self.write_checked(Reg::PulseStep, gate.pulse_step)?;
        self.write_checked(Reg::PulseWidth, gate.pulse_width)?;
        self.write_checked(Reg::PulseDelay, gate.pulse_delay)?;
        self.write_checked(Reg::PulseMax, gate.triggers as f64)?;
        debug!(
            "Timing programmed on {}: step {} (readback {pulse_step})",
            self.prefix, gate.pulse_step
        );
        Ok(TimingReadback { pulse_step })
    }

    // Command records process on any write
    pub fn arm(&self) -> Result<(), FlyScanError> {
        self.write(Reg::Arm, 1.0)
    }

    pub fn disarm(&self) -> Result<(), FlyScanError> {
        self.write(Reg::Disarm, 1.0)
    }

    pub fn reset(&self) -> Result<(), FlyScanError> {
        self.write(Reg::Reset, 1.0)
    }

    pub fn is_armed(&self) -> Result<bool, FlyScanError> {
        Ok(self.read(Reg::ArmedStatus)? != 0.0)
    }

    /// Waveform record for one capture source.
    pub fn waveform(&self, source: CaptureSource) -> Result<Arc<PvChannel>, FlyScanError> {
        self.registry
            .channel(&format!("{}:{}", self.prefix, source.waveform_suffix()))
    }

    /// The shared points-downloaded counter record.
    pub fn counter(&self) -> Result<Arc<PvChannel>, FlyScanError> {
        self.channel(Reg::PointsDownloaded)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::ca::mock::MockTransport;

    pub(crate) const PREFIX: &str = "TS-EA-ZEBRA-01";

    /// Mock transport pre-loaded with the full register map.
    pub(crate) fn mock_zebra() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        let registers = [
            Reg::ArmSource,
            Reg::GateSource,
            Reg::PulseSource,
            Reg::EncoderSelect,
            Reg::Direction,
            Reg::CaptureBitfield,
            Reg::TimeUnit,
            Reg::GateStart,
            Reg::GateWidth,
            Reg::GateNumGates,
            Reg::PulseStep,
            Reg::PulseWidth,
            Reg::PulseDelay,
            Reg::PulseMax,
            Reg::Arm,
            Reg::Disarm,
            Reg::Reset,
            Reg::ArmedStatus,
            Reg::PointsDownloaded,
        ];
        for reg in registers {
            transport.set(&format!("{PREFIX}:{}", reg.suffix()), 0.0);
            if reg.has_readback() {
                transport.set(&format!("{PREFIX}:{}:RBV", reg.suffix()), 0.0);
            }
        }
        for source in [
            CaptureSource::Enc1,
            CaptureSource::Enc2,
            CaptureSource::Enc3,
            CaptureSource::Enc4,
            CaptureSource::Time,
        ] {
            transport.set_waveform(&format!("{PREFIX}:{}", source.waveform_suffix()), vec![]);
        }
        // Command records flip the armed status the way hardware does
        transport.link(
            &format!("{PREFIX}:{}", Reg::Arm.suffix()),
            &format!("{PREFIX}:{}", Reg::ArmedStatus.suffix()),
            1.0,
        );
        transport.link(
            &format!("{PREFIX}:{}", Reg::Disarm.suffix()),
            &format!("{PREFIX}:{}", Reg::ArmedStatus.suffix()),
            0.0,
        );
        transport
    }

    pub(crate) fn device(transport: Arc<MockTransport>) -> ZebraDevice {
        let registry = Arc::new(ChannelRegistry::new(transport));
        ZebraDevice::new(registry, PREFIX, 1e-4)
    }
}

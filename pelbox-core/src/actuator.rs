//! Hardware-facing seam for the box's motors and relay outputs
//!
//! Drivers are dumb: a drive call energizes one direction line and blocks
//! for the requested time, and the caller stops the motor explicitly. That
//! lets the sequence controller chain segments on one motor without a relay
//! glitch between them. Drivers report no failures; GPIO writes are
//! fire-and-forget and errors are only logged.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// PWM duty cycle in percent, always within `0..=100`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DutyCycle(u8);

impl DutyCycle {
    pub const OFF: DutyCycle = DutyCycle(0);
    pub const FULL: DutyCycle = DutyCycle(100);

    /// Returns `None` for values above 100
    pub fn new(percent: u8) -> Option<Self> {
        (percent <= 100).then_some(Self(percent))
    }

    pub fn percent(self) -> u8 {
        self.0
    }

    /// Fraction in `0.0..=1.0`, the unit GPIO PWM APIs expect
    pub fn fraction(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl fmt::Display for DutyCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Physical motors on the box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorId {
    /// Primary expansion ram
    Expansion,
    /// Secondary latch confirming an expansion endpoint
    Latch,
    Door,
}

/// Relay outputs on the box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineId {
    Lock,
    Dismantle,
}

/// One motor's two-direction drive
pub trait ActuatorDriver: Send {
    /// Energize the forward line and block for `duration`. Does not stop.
    fn drive_forward(&mut self, power: DutyCycle, duration: Duration);

    /// Energize the backward line and block for `duration`. Does not stop.
    fn drive_backward(&mut self, power: DutyCycle, duration: Duration);

    /// Keep whatever is energized running for `duration`
    fn hold(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Zero duty on both lines. Idempotent.
    fn stop(&mut self);
}

/// A single digital relay output
pub trait OutputLine: Send {
    fn set(&mut self, high: bool);
}

/// Everything the sequence controller drives
pub struct Hardware {
    pub lock: Box<dyn OutputLine>,
    pub dismantle: Box<dyn OutputLine>,
    pub expansion: Box<dyn ActuatorDriver>,
    pub latch: Box<dyn ActuatorDriver>,
    pub door: Box<dyn ActuatorDriver>,
}

impl Hardware {
    /// Drivers that log and journal their calls
    pub fn simulated(journal: &Journal, realtime: bool) -> Self {
        Self::simulated_with(Some(journal), realtime)
    }

    /// Drivers that only log. Nothing is retained between calls.
    pub fn simulated_logging(realtime: bool) -> Self {
        Self::simulated_with(None, realtime)
    }

    fn simulated_with(journal: Option<&Journal>, realtime: bool) -> Self {
        let motor = |id| Box::new(SimulatedMotor::new(id, journal.cloned(), realtime));
        Self {
            lock: Box::new(SimulatedLine::new(LineId::Lock, journal.cloned())),
            dismantle: Box::new(SimulatedLine::new(LineId::Dismantle, journal.cloned())),
            expansion: motor(MotorId::Expansion),
            latch: motor(MotorId::Latch),
            door: motor(MotorId::Door),
        }
    }
}

/// A call observed by a simulated driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveEvent {
    Forward { motor: MotorId, power: DutyCycle, duration: Duration },
    Backward { motor: MotorId, power: DutyCycle, duration: Duration },
    Hold { motor: MotorId, duration: Duration },
    Stop { motor: MotorId },
    Output { line: LineId, high: bool },
}

impl DriveEvent {
    /// True for calls that move something
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            DriveEvent::Forward { .. } | DriveEvent::Backward { .. } | DriveEvent::Output { .. }
        )
    }
}

/// Shared, append-only log of simulated hardware calls
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<DriveEvent>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: DriveEvent) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    pub fn events(&self) -> Vec<DriveEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of drive pulses and output changes recorded
    pub fn motion_count(&self) -> usize {
        self.events().iter().filter(|e| e.is_motion()).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Motor that logs instead of touching GPIO
pub struct SimulatedMotor {
    motor: MotorId,
    journal: Option<Journal>,
    realtime: bool,
}

impl SimulatedMotor {
    pub fn new(motor: MotorId, journal: Option<Journal>, realtime: bool) -> Self {
        Self { motor, journal, realtime }
    }

    fn record(&self, event: DriveEvent) {
        if let Some(journal) = &self.journal {
            journal.push(event);
        }
    }

    fn wait(&self, duration: Duration) {
        if self.realtime {
            std::thread::sleep(duration);
        }
    }
}

impl ActuatorDriver for SimulatedMotor {
    fn drive_forward(&mut self, power: DutyCycle, duration: Duration) {
        tracing::debug!(motor = ?self.motor, %power, ?duration, "simulated drive forward");
        self.record(DriveEvent::Forward { motor: self.motor, power, duration });
        self.wait(duration);
    }

    fn drive_backward(&mut self, power: DutyCycle, duration: Duration) {
        tracing::debug!(motor = ?self.motor, %power, ?duration, "simulated drive backward");
        self.record(DriveEvent::Backward { motor: self.motor, power, duration });
        self.wait(duration);
    }

    fn hold(&mut self, duration: Duration) {
        self.record(DriveEvent::Hold { motor: self.motor, duration });
        self.wait(duration);
    }

    fn stop(&mut self) {
        tracing::debug!(motor = ?self.motor, "simulated stop");
        self.record(DriveEvent::Stop { motor: self.motor });
    }
}

/// Relay output that logs instead of touching GPIO
pub struct SimulatedLine {
    line: LineId,
    journal: Option<Journal>,
}

impl SimulatedLine {
    pub fn new(line: LineId, journal: Option<Journal>) -> Self {
        Self { line, journal }
    }
}

impl OutputLine for SimulatedLine {
    fn set(&mut self, high: bool) {
        tracing::debug!(line = ?self.line, high, "simulated output");
        if let Some(journal) = &self.journal {
            journal.push(DriveEvent::Output { line: self.line, high });
        }
    }
}

/// Raspberry Pi GPIO backend
#[cfg(feature = "gpio")]
pub mod gpio {
    use std::time::Duration;

    use rppal::gpio::{Gpio, OutputPin};

    use super::{ActuatorDriver, DutyCycle, Hardware, OutputLine};
    use crate::config::{HardwareConfig, MotorPins};

    /// H-bridge channel: one software-PWM pin per direction
    pub struct MotorChannel {
        forward: OutputPin,
        backward: OutputPin,
        frequency: f64,
    }

    impl MotorChannel {
        pub fn new(gpio: &Gpio, pins: MotorPins, frequency: f64) -> rppal::gpio::Result<Self> {
            let mut channel = Self {
                forward: gpio.get(pins.forward)?.into_output_low(),
                backward: gpio.get(pins.backward)?.into_output_low(),
                frequency,
            };
            channel.stop();
            Ok(channel)
        }

        fn energize(
            active: &mut OutputPin,
            idle: &mut OutputPin,
            frequency: f64,
            power: DutyCycle,
        ) {
            if let Err(e) = idle.clear_pwm() {
                tracing::error!("failed to clear PWM on pin {}: {}", idle.pin(), e);
            }
            idle.set_low();
            if let Err(e) = active.set_pwm_frequency(frequency, power.fraction()) {
                tracing::error!("failed to set PWM on pin {}: {}", active.pin(), e);
            }
        }
    }

    impl ActuatorDriver for MotorChannel {
        fn drive_forward(&mut self, power: DutyCycle, duration: Duration) {
            Self::energize(&mut self.forward, &mut self.backward, self.frequency, power);
            std::thread::sleep(duration);
        }

        fn drive_backward(&mut self, power: DutyCycle, duration: Duration) {
            Self::energize(&mut self.backward, &mut self.forward, self.frequency, power);
            std::thread::sleep(duration);
        }

        fn stop(&mut self) {
            for pin in [&mut self.forward, &mut self.backward] {
                if let Err(e) = pin.set_pwm_frequency(self.frequency, 0.0) {
                    tracing::error!("failed to zero PWM on pin {}: {}", pin.pin(), e);
                }
            }
        }
    }

    /// Relay on a plain output pin
    pub struct RelayLine(OutputPin);

    impl OutputLine for RelayLine {
        fn set(&mut self, high: bool) {
            if high {
                self.0.set_high();
            } else {
                self.0.set_low();
            }
        }
    }

    /// Claim every pin named in the config. Relays start low.
    pub fn hardware(config: &HardwareConfig) -> rppal::gpio::Result<Hardware> {
        let gpio = Gpio::new()?;
        let frequency = config.pwm_frequency;

        Ok(Hardware {
            lock: Box::new(RelayLine(gpio.get(config.lock_pin)?.into_output_low())),
            dismantle: Box::new(RelayLine(gpio.get(config.dismantle_pin)?.into_output_low())),
            expansion: Box::new(MotorChannel::new(&gpio, config.expansion, frequency)?),
            latch: Box::new(MotorChannel::new(&gpio, config.latch, frequency)?),
            door: Box::new(MotorChannel::new(&gpio, config.door, frequency)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duty_cycle_bounds() {
        assert_eq!(DutyCycle::new(100), Some(DutyCycle::FULL));
        assert_eq!(DutyCycle::new(0), Some(DutyCycle::OFF));
        assert!(DutyCycle::new(101).is_none());
        assert!((DutyCycle::new(40).unwrap().fraction() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_simulated_motor_journals_calls() {
        let journal = Journal::new();
        let mut motor = SimulatedMotor::new(MotorId::Door, Some(journal.clone()), false);

        motor.drive_forward(DutyCycle::FULL, Duration::from_secs(4));
        motor.stop();
        motor.stop();

        assert_eq!(
            journal.events(),
            vec![
                DriveEvent::Forward {
                    motor: MotorId::Door,
                    power: DutyCycle::FULL,
                    duration: Duration::from_secs(4),
                },
                DriveEvent::Stop { motor: MotorId::Door },
                DriveEvent::Stop { motor: MotorId::Door },
            ]
        );
        assert_eq!(journal.motion_count(), 1);
    }

    #[test]
    fn test_simulated_hardware_shares_journal() {
        let journal = Journal::new();
        let mut hw = Hardware::simulated(&journal, false);

        hw.dismantle.set(true);
        hw.latch.drive_backward(DutyCycle::FULL, Duration::from_millis(10));

        assert_eq!(journal.events().len(), 2);
        journal.clear();
        assert!(journal.events().is_empty());
    }

    #[test]
    fn test_logging_hardware_keeps_no_history() {
        let mut hw = Hardware::simulated_logging(false);
        for _ in 0..3 {
            hw.lock.set(true);
            hw.door.drive_forward(DutyCycle::FULL, Duration::from_millis(5));
            hw.door.stop();
        }

        let motor = SimulatedMotor::new(MotorId::Door, None, false);
        assert!(motor.journal.is_none());
    }
}

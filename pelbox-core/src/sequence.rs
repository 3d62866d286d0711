//! Actuator sequencing
//!
//! Turns a requested target for one actuator into an ordered list of driver
//! calls, runs it to completion on a blocking worker, then records the new
//! position. Planning is a pure function of the current `DeviceState` and the
//! command, so the motion for a command never depends on anything older than
//! the previous recorded position.
//!
//! Each actuator owns its hardware behind its own mutex: two commands for the
//! same actuator run one after the other, commands for different actuators
//! run side by side. A sequence is never cancelled once started, and the
//! state is only written after the last step returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;

use crate::actuator::{ActuatorDriver, DutyCycle, Hardware, LineId, MotorId, OutputLine};
use crate::config::Calibration;
use crate::device::{
    ActuatorUpdate, DeviceState, DismantlePosition, DoorPosition, LockPosition, Travel,
};

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("Invalid target for {actuator}: {value}")]
    InvalidTarget { actuator: &'static str, value: String },

    #[error("Device state has not been seeded from storage")]
    NotSeeded,

    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("Actuation worker failed: {0}")]
    Worker(String),
}

/// A requested target for one actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Lock(LockPosition),
    Dismantle(DismantlePosition),
    Door(DoorPosition),
    /// Raw level from the request; validated against the calibrated range
    Expansion(i64),
}

impl Command {
    pub fn actuator(&self) -> &'static str {
        match self {
            Command::Lock(_) => "lock",
            Command::Dismantle(_) => "dismantle",
            Command::Door(_) => "door",
            Command::Expansion(_) => "expansion",
        }
    }
}

/// One hardware call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Forward { motor: MotorId, power: DutyCycle, duration: Duration },
    Backward { motor: MotorId, power: DutyCycle, duration: Duration },
    Hold { motor: MotorId, duration: Duration },
    Stop { motor: MotorId },
    Output { line: LineId, high: bool },
}

/// Steps to run and the state change they produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<Step>,
    /// `None` when the actuator is already at the target
    pub update: Option<ActuatorUpdate>,
}

impl Plan {
    fn noop() -> Self {
        Self { steps: Vec::new(), update: None }
    }
}

/// Validated calibration used for planning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub power: DutyCycle,
    pub max_level: u8,
    pub endpoint_time: Duration,
    pub increment: Duration,
    pub settle: Duration,
    pub latch_extend: Duration,
    pub latch_retract: Duration,
    pub latch_settle: Duration,
    pub door_travel: Duration,
}

impl TryFrom<&Calibration> for Timing {
    type Error = SequenceError;

    fn try_from(cal: &Calibration) -> Result<Self, Self::Error> {
        let power = DutyCycle::new(cal.power).ok_or_else(|| {
            SequenceError::InvalidCalibration(format!("power {} is not a percentage", cal.power))
        })?;
        if cal.max_level == 0 {
            return Err(SequenceError::InvalidCalibration("max_level must be at least 1".into()));
        }

        Ok(Self {
            power,
            max_level: cal.max_level,
            endpoint_time: cal.endpoint_time(),
            increment: cal.increment(),
            settle: cal.settle(),
            latch_extend: cal.latch_extend(),
            latch_retract: cal.latch_retract(),
            latch_settle: cal.latch_settle(),
            door_travel: cal.door_travel(),
        })
    }
}

impl Timing {
    /// Reject targets outside the actuator's domain
    pub fn validate(&self, command: Command) -> Result<(), SequenceError> {
        if let Command::Expansion(level) = command {
            if !(0..=i64::from(self.max_level)).contains(&level) {
                return Err(SequenceError::InvalidTarget {
                    actuator: "expansion",
                    value: format!("{level} (expected 0..={})", self.max_level),
                });
            }
        }
        Ok(())
    }

    /// Ram travel time across `levels` levels. The endpoint time covers the
    /// whole `0..=max_level` range.
    fn travel_time(&self, levels: u8) -> Duration {
        let levels = levels.min(self.max_level);
        self.endpoint_time * u32::from(levels) / u32::from(self.max_level)
    }

    /// Compute the motion that takes `state` to the commanded target
    pub fn plan(&self, state: &DeviceState, command: Command) -> Result<Plan, SequenceError> {
        self.validate(command)?;

        let plan = match command {
            Command::Lock(target) => {
                if state.lock == target {
                    Plan::noop()
                } else {
                    Plan {
                        steps: vec![Step::Output { line: LineId::Lock, high: target.is_locked() }],
                        update: Some(ActuatorUpdate::Lock(target)),
                    }
                }
            }
            Command::Dismantle(target) => {
                if state.dismantle == target {
                    Plan::noop()
                } else {
                    Plan {
                        steps: vec![Step::Output {
                            line: LineId::Dismantle,
                            high: target.is_engaged(),
                        }],
                        update: Some(ActuatorUpdate::Dismantle(target)),
                    }
                }
            }
            Command::Door(target) => {
                if state.door == target {
                    Plan::noop()
                } else {
                    let motor = MotorId::Door;
                    let drive = if target.is_open() {
                        Step::Forward { motor, power: self.power, duration: self.door_travel }
                    } else {
                        Step::Backward { motor, power: self.power, duration: self.door_travel }
                    };
                    Plan {
                        steps: vec![drive, Step::Stop { motor }],
                        update: Some(ActuatorUpdate::Door(target)),
                    }
                }
            }
            Command::Expansion(level) => {
                // validated above
                let target = u8::try_from(level).unwrap_or(self.max_level);
                self.plan_expansion(state.previous_expansion(), target)
            }
        };

        Ok(plan)
    }

    fn plan_expansion(&self, prev: u8, target: u8) -> Plan {
        let ram = MotorId::Expansion;
        let latch = MotorId::Latch;
        let power = self.power;

        let (steps, travel) = if target == self.max_level {
            let remaining = self.max_level.saturating_sub(prev);
            (
                vec![
                    Step::Forward { motor: ram, power, duration: self.travel_time(remaining) },
                    Step::Hold { motor: ram, duration: self.settle },
                    Step::Stop { motor: ram },
                    Step::Forward { motor: latch, power, duration: self.latch_extend },
                    Step::Hold { motor: latch, duration: self.latch_settle },
                    Step::Stop { motor: latch },
                ],
                Travel::Extended,
            )
        } else if target == 0 {
            (
                vec![
                    Step::Backward { motor: ram, power, duration: self.travel_time(prev) },
                    Step::Hold { motor: ram, duration: self.settle },
                    Step::Stop { motor: ram },
                    Step::Backward { motor: latch, power, duration: self.latch_retract },
                    Step::Hold { motor: latch, duration: self.latch_settle },
                    Step::Stop { motor: latch },
                ],
                Travel::Retracted,
            )
        } else if prev < target {
            (
                vec![
                    Step::Forward { motor: ram, power, duration: self.increment },
                    Step::Stop { motor: ram },
                ],
                Travel::Intermediate,
            )
        } else {
            (
                vec![
                    Step::Backward { motor: ram, power, duration: self.increment },
                    Step::Stop { motor: ram },
                ],
                Travel::Intermediate,
            )
        };

        Plan {
            steps,
            update: Some(ActuatorUpdate::Expansion { level: target, travel }),
        }
    }
}

/// Result of a completed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Steps that were run, empty for a no-op
    pub steps: Vec<Step>,
    pub update: Option<ActuatorUpdate>,
    /// State after the command
    pub state: DeviceState,
}

impl Outcome {
    pub fn moved(&self) -> bool {
        !self.steps.is_empty()
    }
}

struct ExpansionRig {
    primary: Box<dyn ActuatorDriver>,
    latch: Box<dyn ActuatorDriver>,
}

/// The hardware held by one locked actuator
enum Rig<'a> {
    Line { id: LineId, line: &'a mut dyn OutputLine },
    Expansion(&'a mut ExpansionRig),
    Door(&'a mut dyn ActuatorDriver),
}

impl Rig<'_> {
    fn motor(&mut self, motor: MotorId) -> Option<&mut dyn ActuatorDriver> {
        match (self, motor) {
            (Rig::Expansion(rig), MotorId::Expansion) => Some(rig.primary.as_mut()),
            (Rig::Expansion(rig), MotorId::Latch) => Some(rig.latch.as_mut()),
            (Rig::Door(driver), MotorId::Door) => Some(&mut **driver),
            _ => None,
        }
    }

    fn with_motor(&mut self, motor: MotorId, f: impl FnOnce(&mut dyn ActuatorDriver)) {
        match self.motor(motor) {
            Some(driver) => f(driver),
            None => tracing::error!(?motor, "step targets a motor outside the locked actuator"),
        }
    }

    fn perform(&mut self, step: Step) {
        match step {
            Step::Forward { motor, power, duration } => {
                self.with_motor(motor, |d| d.drive_forward(power, duration));
            }
            Step::Backward { motor, power, duration } => {
                self.with_motor(motor, |d| d.drive_backward(power, duration));
            }
            Step::Hold { motor, duration } => self.with_motor(motor, |d| d.hold(duration)),
            Step::Stop { motor } => self.with_motor(motor, |d| d.stop()),
            Step::Output { line, high } => match self {
                Rig::Line { id, line: output } if *id == line => output.set(high),
                _ => tracing::error!(?line, "step targets a line outside the locked actuator"),
            },
        }
    }
}

struct Inner {
    timing: Timing,
    lock: Mutex<Box<dyn OutputLine>>,
    dismantle: Mutex<Box<dyn OutputLine>>,
    expansion: Mutex<ExpansionRig>,
    door: Mutex<Box<dyn ActuatorDriver>>,
    state: RwLock<Option<DeviceState>>,
}

fn acquire<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn current(&self) -> Option<DeviceState> {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, command: Command) -> Result<Outcome, SequenceError> {
        match command {
            Command::Lock(_) => {
                let mut line = acquire(&self.lock);
                self.execute(Rig::Line { id: LineId::Lock, line: &mut **line }, command)
            }
            Command::Dismantle(_) => {
                let mut line = acquire(&self.dismantle);
                self.execute(Rig::Line { id: LineId::Dismantle, line: &mut **line }, command)
            }
            Command::Expansion(_) => {
                let mut rig = acquire(&self.expansion);
                self.execute(Rig::Expansion(&mut *rig), command)
            }
            Command::Door(_) => {
                let mut driver = acquire(&self.door);
                self.execute(Rig::Door(&mut **driver), command)
            }
        }
    }

    /// Caller holds the actuator's mutex for the whole call
    fn execute(&self, mut rig: Rig<'_>, command: Command) -> Result<Outcome, SequenceError> {
        let current = self.current().ok_or(SequenceError::NotSeeded)?;
        let plan = self.timing.plan(&current, command)?;

        if plan.steps.is_empty() {
            tracing::debug!(actuator = command.actuator(), "already at target, nothing to do");
        } else {
            tracing::info!(
                actuator = command.actuator(),
                steps = plan.steps.len(),
                "running actuation sequence"
            );
        }

        for step in &plan.steps {
            rig.perform(*step);
        }

        let state = {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let state = guard.get_or_insert(current);
            if let Some(update) = plan.update {
                state.apply(update);
            }
            *state
        };

        Ok(Outcome { steps: plan.steps, update: plan.update, state })
    }
}

/// Drives the box and owns its `DeviceState`
#[derive(Clone)]
pub struct SequenceController {
    inner: Arc<Inner>,
}

impl SequenceController {
    pub fn new(hardware: Hardware, calibration: &Calibration) -> Result<Self, SequenceError> {
        let timing = Timing::try_from(calibration)?;
        let Hardware { lock, dismantle, expansion, latch, door } = hardware;

        Ok(Self {
            inner: Arc::new(Inner {
                timing,
                lock: Mutex::new(lock),
                dismantle: Mutex::new(dismantle),
                expansion: Mutex::new(ExpansionRig { primary: expansion, latch }),
                door: Mutex::new(door),
                state: RwLock::new(None),
            }),
        })
    }

    pub fn timing(&self) -> &Timing {
        &self.inner.timing
    }

    /// Install the stored state unless one is already held.
    /// Returns true if this call seeded it.
    pub fn seed(&self, state: DeviceState) -> bool {
        let mut guard = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return false;
        }
        tracing::info!(?state, "seeded device state from storage");
        *guard = Some(state);
        true
    }

    pub fn is_seeded(&self) -> bool {
        self.inner.current().is_some()
    }

    pub fn snapshot(&self) -> Option<DeviceState> {
        self.inner.current()
    }

    /// Run the command to completion and return the resulting state.
    ///
    /// An out-of-range target is rejected before any hardware is touched.
    pub async fn apply(&self, command: Command) -> Result<Outcome, SequenceError> {
        self.inner.timing.validate(command)?;
        if !self.is_seeded() {
            return Err(SequenceError::NotSeeded);
        }

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.run(command))
            .await
            .map_err(|e| SequenceError::Worker(e.to_string()))?
    }
}

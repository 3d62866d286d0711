//! In-memory mirror of the box's last commanded positions
//!
//! The box is open-loop: nothing reads back where the mechanism actually is.
//! `DeviceState` records what the last completed sequence commanded, and the
//! sequence controller plans the next motion from it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPosition {
    Locked,
    Unlocked,
}

impl From<bool> for LockPosition {
    fn from(locked: bool) -> Self {
        if locked { Self::Locked } else { Self::Unlocked }
    }
}

impl LockPosition {
    pub fn is_locked(self) -> bool {
        self == Self::Locked
    }
}

/// Dismantle release latch. `Engaged` drives the relay high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DismantlePosition {
    Engaged,
    Released,
}

impl From<bool> for DismantlePosition {
    fn from(dismantle: bool) -> Self {
        if dismantle { Self::Engaged } else { Self::Released }
    }
}

impl DismantlePosition {
    pub fn is_engaged(self) -> bool {
        self == Self::Engaged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorPosition {
    Open,
    #[serde(rename = "close", alias = "closed")]
    Closed,
}

impl DoorPosition {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl From<bool> for DoorPosition {
    fn from(open: bool) -> Self {
        if open { Self::Open } else { Self::Closed }
    }
}

/// Where the expansion ram was last driven to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Travel {
    /// Endpoint pulse at level 0 completed
    Retracted,
    /// Somewhere between the endpoints
    Intermediate,
    /// Endpoint pulse at MAX completed
    Extended,
}

/// Snapshot of every actuator's last commanded position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub lock: LockPosition,
    pub dismantle: DismantlePosition,
    pub door: DoorPosition,
    pub expansion: u8,
    /// Level recorded by this process. `None` until the first expansion
    /// command after a restart; storage only keeps `expansion`.
    pub last_known_expansion: Option<u8>,
    pub travel: Travel,
}

impl DeviceState {
    /// Seed from persisted actuator fields.
    ///
    /// Stored levels are clamped into `0..=max_level`; a negative or oversized
    /// value comes from an older calibration and is treated as the nearest
    /// endpoint.
    pub fn seeded(
        locked: bool,
        dismantle: bool,
        door_open: bool,
        expansion: i32,
        max_level: u8,
    ) -> Self {
        let expansion = u8::try_from(expansion.clamp(0, i32::from(max_level))).unwrap_or(max_level);
        let travel = if expansion == 0 {
            Travel::Retracted
        } else if expansion == max_level {
            Travel::Extended
        } else {
            Travel::Intermediate
        };

        Self {
            lock: locked.into(),
            dismantle: dismantle.into(),
            door: door_open.into(),
            expansion,
            last_known_expansion: None,
            travel,
        }
    }

    /// Level the next expansion command starts from
    pub fn previous_expansion(&self) -> u8 {
        self.last_known_expansion.unwrap_or(self.expansion)
    }

    pub fn fully_extended(&self) -> bool {
        self.travel == Travel::Extended
    }

    pub fn fully_retracted(&self) -> bool {
        self.travel == Travel::Retracted
    }

    pub(crate) fn apply(&mut self, update: ActuatorUpdate) {
        match update {
            ActuatorUpdate::Lock(lock) => self.lock = lock,
            ActuatorUpdate::Dismantle(dismantle) => self.dismantle = dismantle,
            ActuatorUpdate::Door(door) => self.door = door,
            ActuatorUpdate::Expansion { level, travel } => {
                self.expansion = level;
                self.last_known_expansion = Some(level);
                self.travel = travel;
            }
        }
    }
}

/// The single field a completed sequence changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorUpdate {
    Lock(LockPosition),
    Dismantle(DismantlePosition),
    Door(DoorPosition),
    Expansion { level: u8, travel: Travel },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_clamps_stored_level() {
        let state = DeviceState::seeded(true, false, false, 8, 5);
        assert_eq!(state.expansion, 5);
        assert!(state.fully_extended());
        assert_eq!(state.lock, LockPosition::Locked);
        assert_eq!(state.last_known_expansion, None);

        let state = DeviceState::seeded(false, true, true, -2, 5);
        assert_eq!(state.expansion, 0);
        assert!(state.fully_retracted());
        assert!(state.dismantle.is_engaged());
        assert!(state.door.is_open());
    }

    #[test]
    fn test_expansion_update_records_last_known() {
        let mut state = DeviceState::seeded(false, false, false, 2, 5);
        assert_eq!(state.previous_expansion(), 2);

        state.apply(ActuatorUpdate::Expansion { level: 4, travel: Travel::Intermediate });
        assert_eq!(state.expansion, 4);
        assert_eq!(state.last_known_expansion, Some(4));
        assert_eq!(state.previous_expansion(), 4);
    }

    #[test]
    fn test_door_wire_names() {
        let door: DoorPosition = serde_json::from_str("\"close\"").unwrap();
        assert_eq!(door, DoorPosition::Closed);
        let door: DoorPosition = serde_json::from_str("\"closed\"").unwrap();
        assert_eq!(door, DoorPosition::Closed);
        assert_eq!(serde_json::to_string(&DoorPosition::Open).unwrap(), "\"open\"");
    }
}

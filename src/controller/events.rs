use chrono::{DateTime, Local};

use super::driver::DriverIdentity;

/// Guide/home button bit in [`ControllerState::button_flags`]
pub const SPECIAL_BUTTON_FLAG: u32 = 0x0400;

// Controller state as reported to the host input subsystem
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub button_flags: u32,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub left_stick_x: i16,
    pub left_stick_y: i16,
    pub right_stick_x: i16,
    pub right_stick_y: i16,
}

impl ControllerState {
    pub fn set_button_flag(&mut self, flag: u32, pressed: bool) {
        if pressed {
            self.button_flags |= flag;
        } else {
            self.button_flags &= !flag;
        }
    }

    pub fn special_button(&self) -> bool {
        self.button_flags & SPECIAL_BUTTON_FLAG != 0
    }
}

/// Notifications a driver sends to the host
///
/// For one driver instance the order is always `DeviceAdded`, any number of
/// `InputUpdated`, then `DeviceRemoved`. Nothing follows `DeviceRemoved`.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    DeviceAdded {
        identity: DriverIdentity,
        timestamp: DateTime<Local>,
    },
    InputUpdated {
        device_id: u32,
        state: ControllerState,
        timestamp: DateTime<Local>,
    },
    DeviceRemoved {
        device_id: u32,
        timestamp: DateTime<Local>,
    },
}

impl DriverEvent {
    pub fn device_id(&self) -> u32 {
        match self {
            DriverEvent::DeviceAdded { identity, .. } => identity.device_id,
            DriverEvent::InputUpdated { device_id, .. } => *device_id,
            DriverEvent::DeviceRemoved { device_id, .. } => *device_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_flag_sets_and_clears_only_its_bit() {
        let mut state = ControllerState {
            button_flags: 0x1000,
            ..Default::default()
        };

        state.set_button_flag(SPECIAL_BUTTON_FLAG, true);
        assert_eq!(state.button_flags, 0x1400);
        assert!(state.special_button());

        state.set_button_flag(SPECIAL_BUTTON_FLAG, false);
        assert_eq!(state.button_flags, 0x1000);
        assert!(!state.special_button());
    }
}

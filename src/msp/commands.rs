//! Outbound command builders
//!
//! Each builder produces a [`Command`]: the code, the encoded payload and the
//! retry budget the flight controller firmware is known to need for it.

use super::code::MspCode;
use crate::constants::{DATAFLASH_READ_RETRIES, DEFAULT_RETRIES};
use crate::state::{
    GeoPoint, ModeRange, RcTuning, Waypoint, WaypointAction, INAV_POSHOLD_WAYPOINT,
    LAST_WAYPOINT_FLAG, POSHOLD_WAYPOINT,
};
use bytes::BufMut;

/// Longest craft name the firmware stores
pub const MAX_CRAFT_NAME_LEN: usize = 16;

/// One outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub code: MspCode,
    pub payload: Vec<u8>,
    /// Retries after the first attempt
    pub retries: u32,
}

impl Command {
    pub fn new(code: MspCode, payload: Vec<u8>, retries: u32) -> Self {
        Self {
            code,
            payload,
            retries,
        }
    }

    /// Request with no payload and the default retry budget
    pub fn query(code: MspCode) -> Self {
        Self::new(code, Vec::new(), DEFAULT_RETRIES)
    }

    /// Fire and forget: no retries, no acknowledgement expected
    pub fn unacknowledged(mut self) -> Self {
        self.retries = 0;
        self
    }
}

fn degrees_e7(degrees: f64) -> i32 {
    (degrees * 10_000_000.0) as i32
}

fn centi(value: f64) -> u8 {
    (value * 100.0).round().clamp(0.0, u8::MAX as f64) as u8
}

/// MSP_SET_RAW_RC: one u16 per channel, sent at stick rate without retries
pub fn raw_rc(channels: &[u16]) -> Command {
    let mut payload = Vec::with_capacity(channels.len() * 2);
    for &value in channels {
        payload.put_u16_le(value);
    }
    Command::new(MspCode::SetRawRc, payload, 0)
}

/// MSP_SET_WP, MultiWii/Cleanflight layout
///
/// Waypoint 0 is home and 16 is the position hold target; the firmware
/// ignores other numbers. An altitude of 0 keeps the current altitude hold.
pub fn set_waypoint(number: u8, position: GeoPoint, altitude: f64) -> Command {
    let mut payload = Vec::with_capacity(18);
    payload.put_u8(number);
    payload.put_i32_le(degrees_e7(position.latitude));
    payload.put_i32_le(degrees_e7(position.longitude));
    payload.put_i32_le((altitude * 100.0) as i32);
    // heading, time to stay, nav flags
    payload.put_bytes(0, 5);
    Command::new(MspCode::SetWp, payload, DEFAULT_RETRIES)
}

/// MSP_SET_WP, iNav layout
pub fn set_inav_waypoint(waypoint: &Waypoint) -> Command {
    let mut payload = Vec::with_capacity(21);
    payload.put_u8(waypoint.number);
    payload.put_u8(waypoint.action.into());
    payload.put_i32_le(degrees_e7(waypoint.position.latitude));
    payload.put_i32_le(degrees_e7(waypoint.position.longitude));
    payload.put_i32_le((waypoint.altitude * 100.0) as i32);
    payload.put_i16_le(waypoint.param1);
    payload.put_i16_le(waypoint.param2);
    payload.put_i16_le(waypoint.param3);
    payload.put_u8(if waypoint.last { LAST_WAYPOINT_FLAG } else { 0 });
    Command::new(MspCode::SetWp, payload, DEFAULT_RETRIES)
}

/// Move the position hold target
pub fn gps_hold(is_inav: bool, position: GeoPoint, altitude: f64) -> Command {
    if is_inav {
        set_inav_waypoint(&Waypoint {
            number: INAV_POSHOLD_WAYPOINT,
            action: WaypointAction::Waypoint,
            position,
            altitude,
            param1: 0,
            param2: 0,
            param3: 0,
            last: false,
        })
    } else {
        set_waypoint(POSHOLD_WAYPOINT, position, altitude)
    }
}

/// MSP_WP request for one waypoint
pub fn get_waypoint(number: u8) -> Command {
    Command::new(MspCode::Wp, vec![number], DEFAULT_RETRIES)
}

/// MSP_SELECT_SETTING. Some firmwares also write the EEPROM.
pub fn select_profile(profile: u8) -> Command {
    Command::new(MspCode::SelectSetting, vec![profile], DEFAULT_RETRIES)
}

/// MSP_DATAFLASH_READ starting at `address`
pub fn dataflash_read(address: u32) -> Command {
    let mut payload = Vec::with_capacity(4);
    payload.put_u32_le(address);
    Command::new(MspCode::DataflashRead, payload, DATAFLASH_READ_RETRIES)
}

/// MSP_SET_NAME, truncated to what the firmware stores
pub fn set_name(name: &str) -> Command {
    let mut end = name.len().min(MAX_CRAFT_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    Command::new(MspCode::SetName, name[..end].as_bytes().to_vec(), DEFAULT_RETRIES)
}

pub fn set_arming_config(auto_disarm_delay: u8, disarm_kill_switch: bool) -> Command {
    Command::new(
        MspCode::SetArmingConfig,
        vec![auto_disarm_delay, disarm_kill_switch as u8],
        DEFAULT_RETRIES,
    )
}

/// MSP_SET_RC_TUNING; the trailing yaw rate byte is only read by
/// Betaflight and Cleanflight 2.0, older firmwares ignore it
pub fn set_rc_tuning(tuning: &RcTuning) -> Command {
    let mut payload = Vec::with_capacity(12);
    for rate in [
        tuning.rc_rate,
        tuning.rc_expo,
        tuning.roll_rate,
        tuning.pitch_rate,
        tuning.yaw_rate,
        tuning.tpa_rate,
        tuning.throttle_mid,
        tuning.throttle_expo,
    ] {
        payload.put_u8(centi(rate));
    }
    payload.put_u16_le(tuning.tpa_breakpoint);
    payload.put_u8(centi(tuning.yaw_expo));
    payload.put_u8(centi(tuning.yaw_rc_rate.unwrap_or(tuning.rc_rate)));
    Command::new(MspCode::SetRcTuning, payload, DEFAULT_RETRIES)
}

/// MSP_SET_MODE_RANGE for slot `index`
pub fn set_mode_range(index: u8, range: &ModeRange) -> Command {
    Command::new(
        MspCode::SetModeRange,
        vec![
            index,
            range.mode_id,
            range.aux_channel,
            range.start_step(),
            range.end_step(),
        ],
        DEFAULT_RETRIES,
    )
}

pub fn set_beeper_config(mask: u32) -> Command {
    let mut payload = Vec::with_capacity(4);
    payload.put_u32_le(mask);
    Command::new(MspCode::SetBeeperConfig, payload, DEFAULT_RETRIES)
}

pub fn eeprom_write() -> Command {
    Command::query(MspCode::EepromWrite)
}

pub fn reboot() -> Command {
    Command::query(MspCode::SetReboot)
}

pub fn calibrate_accelerometer() -> Command {
    Command::query(MspCode::AccCalibration)
}

pub fn calibrate_magnetometer() -> Command {
    Command::query(MspCode::MagCalibration)
}

pub fn reset_config() -> Command {
    Command::query(MspCode::ResetConf)
}

/// Load the iNav mission from EEPROM
pub fn load_mission() -> Command {
    Command::new(MspCode::WpMissionLoad, vec![0], DEFAULT_RETRIES)
}

/// Save the iNav mission to EEPROM
pub fn save_mission() -> Command {
    Command::new(MspCode::WpMissionSave, vec![0], DEFAULT_RETRIES)
}

//! Board identity and configuration records

use super::config::{
    AdvancedConfig, BatteryConfig, BoardAlignment, CurrentMeter, FilterConfig, FixedWing,
    GpsConfig, MotorConfig, Osd, PositionHold, RcDeadband, ReturnToHome, RxConfig,
    RxFailChannel, SerialPort, ServoConfig, VoltageMeter,
};
use serde::{Deserialize, Serialize};

/// Firmware variant identifier reported by iNav in MSP_FC_VARIANT
pub const INAV_VARIANT: &str = "INAV";

/// Board and firmware identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    /// MSP_IDENT firmware version ("2.40")
    pub multiwii_version: String,
    pub msp_version: u8,
    pub capability: u32,

    pub msp_protocol_version: u8,
    /// MSP_API_VERSION ("1.40")
    pub api_version: String,
    /// Four-letter firmware id (e.g. "INAV", "BTFL", "CLFL")
    pub fc_variant: String,
    pub fc_version: String,
    /// "MMM DD YYYY HH:MM:SS"
    pub build_info: String,
    pub board_id: String,
    pub board_version: u16,
    pub uid: String,
    pub craft_name: String,
}

impl Identity {
    pub fn is_inav(&self) -> bool {
        self.fc_variant == INAV_VARIANT
    }
}

/// Switch range assigning a mode to an aux channel (µs bounds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeRange {
    pub mode_id: u8,
    pub aux_channel: u8,
    pub start: u16,
    pub end: u16,
}

/// Lower bound of a mode range step
pub const MODE_RANGE_BASE: u16 = 900;
/// Width of a mode range step (µs)
pub const MODE_RANGE_STEP: u16 = 25;

impl ModeRange {
    pub fn from_steps(mode_id: u8, aux_channel: u8, start_step: u8, end_step: u8) -> Self {
        Self {
            mode_id,
            aux_channel,
            start: MODE_RANGE_BASE + start_step as u16 * MODE_RANGE_STEP,
            end: MODE_RANGE_BASE + end_step as u16 * MODE_RANGE_STEP,
        }
    }

    pub fn start_step(&self) -> u8 {
        (self.start.saturating_sub(MODE_RANGE_BASE) / MODE_RANGE_STEP) as u8
    }

    pub fn end_step(&self) -> u8 {
        (self.end.saturating_sub(MODE_RANGE_BASE) / MODE_RANGE_STEP) as u8
    }
}

/// MSP_RC_TUNING, rates as fractions (wire value / 100)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcTuning {
    pub rc_rate: f64,
    pub rc_expo: f64,
    pub roll_rate: f64,
    pub pitch_rate: f64,
    pub yaw_rate: f64,
    pub tpa_rate: f64,
    pub throttle_mid: f64,
    pub throttle_expo: f64,
    pub tpa_breakpoint: u16,
    pub yaw_expo: f64,
    /// Only sent by Betaflight and Cleanflight 2.0
    pub yaw_rc_rate: Option<f64>,
}

/// MSP_MISC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Misc {
    pub mid_rc: i16,
    pub min_throttle: i16,
    pub max_throttle: i16,
    pub min_command: i16,
    pub failsafe_throttle: i16,
    pub gps_type: u8,
    pub gps_ubx_sbas: u8,
    pub rssi_channel: u8,
    /// Degrees
    pub mag_declination: f64,
    pub vbat_scale: u8,
    /// Volts per cell
    pub vbat_min_cell: f64,
    pub vbat_max_cell: f64,
    pub vbat_warning_cell: f64,
}

/// MSP_FAILSAFE_CONFIG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Failsafe {
    /// Seconds
    pub delay: f64,
    pub off_delay: f64,
    pub throttle: i16,
    pub kill_switch: bool,
    pub throttle_low_delay: f64,
    pub procedure: u8,
}

/// MSP_VTX_CONFIG
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vtx {
    pub device_type: u8,
    pub band: u8,
    pub channel: u8,
    pub power_index: Option<u8>,
    pub pit_mode: Option<bool>,
}

/// Tunables read from the flight controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mixer_type: u8,
    pub box_names: Vec<String>,
    pub box_ids: Vec<u8>,
    pub pid_names: Vec<String>,
    /// P, I, D per PID slot, raw wire values
    pub pids: Vec<[u8; 3]>,
    pub mode_ranges: Vec<ModeRange>,
    /// Number of range slots the firmware has, used or not
    pub mode_range_slots: usize,
    pub rc_tuning: RcTuning,
    pub misc: Misc,
    pub failsafe: Failsafe,
    pub auto_disarm_delay: u8,
    pub disarm_kill_switch: bool,
    pub loop_time: u16,
    pub pid_controller: u8,
    pub acc_trim_pitch: i16,
    pub acc_trim_roll: i16,
    pub beeper_mask: u32,
    pub vtx: Vtx,

    /// MSP_FEATURE bitmask
    pub features: u32,
    pub yaw_motors_reversed: Option<bool>,
    pub board_alignment: BoardAlignment,
    pub motor_config: MotorConfig,
    pub gps_config: GpsConfig,
    pub rc_deadband: RcDeadband,
    pub advanced: AdvancedConfig,
    pub filters: FilterConfig,
    pub rx_config: RxConfig,
    pub rx_fail: Vec<RxFailChannel>,
    pub serial_ports: Vec<SerialPort>,
    pub servo_configs: Vec<ServoConfig>,
    pub battery: BatteryConfig,
    pub voltage_meter: VoltageMeter,
    pub current_meter: CurrentMeter,
    pub osd: Osd,

    pub position_hold: PositionHold,
    pub return_to_home: ReturnToHome,
    pub fixed_wing: FixedWing,
}

/// Box (mode) ids shared by all MSP firmwares
pub mod mode {
    pub const ARM: u8 = 0;
    pub const ANGLE: u8 = 1;
    pub const HORIZON: u8 = 2;
    pub const BARO: u8 = 3;
    pub const MAG: u8 = 5;
    pub const GPS_HOME: u8 = 10;
    pub const GPS_HOLD: u8 = 11;
    pub const FAILSAFE: u8 = 27;
}

impl Settings {
    /// Whether the box with id `mode_id` is active in `mode_flags`
    ///
    /// Bit `i` of the status mode mask refers to the `i`-th entry of
    /// MSP_BOXIDS, not to the box id itself.
    pub fn is_mode_active(&self, mode_flags: u32, mode_id: u8) -> bool {
        self.box_ids
            .iter()
            .position(|&id| id == mode_id)
            .filter(|&bit| bit < 32)
            .is_some_and(|bit| mode_flags & (1 << bit) != 0)
    }

    pub fn active_modes(&self, mode_flags: u32) -> Vec<u8> {
        self.box_ids
            .iter()
            .take(32)
            .enumerate()
            .filter(|(bit, _)| mode_flags & (1 << bit) != 0)
            .map(|(_, &id)| id)
            .collect()
    }
}

/// Onboard flash, SD card and blackbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    pub dataflash_ready: bool,
    pub dataflash_sectors: u32,
    pub dataflash_total_size: u32,
    pub dataflash_used_size: u32,

    pub sdcard_supported: bool,
    pub sdcard_state: u8,
    pub sdcard_last_error: u8,
    /// Bytes
    pub sdcard_free_space: u64,
    pub sdcard_total_space: u64,

    pub blackbox_supported: bool,
    pub blackbox_device: u8,
    pub blackbox_rate_num: u8,
    pub blackbox_rate_denom: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_range_steps() {
        let range = ModeRange::from_steps(mode::ANGLE, 1, 4, 12);
        assert_eq!(range.start, 1000);
        assert_eq!(range.end, 1200);
        assert_eq!(range.start_step(), 4);
        assert_eq!(range.end_step(), 12);
    }

    #[test]
    fn test_mode_bits_follow_box_order() {
        let settings = Settings {
            box_ids: vec![mode::ARM, mode::ANGLE, mode::GPS_HOLD],
            ..Default::default()
        };
        let flags = 0b101;
        assert!(settings.is_mode_active(flags, mode::ARM));
        assert!(!settings.is_mode_active(flags, mode::ANGLE));
        assert!(settings.is_mode_active(flags, mode::GPS_HOLD));
        assert!(!settings.is_mode_active(flags, mode::BARO));
        assert_eq!(settings.active_modes(flags), vec![mode::ARM, mode::GPS_HOLD]);
    }

    #[test]
    fn test_is_inav() {
        let identity = Identity {
            fc_variant: "INAV".into(),
            ..Default::default()
        };
        assert!(identity.is_inav());
        assert!(!Identity::default().is_inav());
    }
}

//! Flight controller configuration records
//!
//! One record per MSP config message. Distances and speeds are converted
//! from the firmware's centimetres to metres; everything else keeps its wire
//! value. Fields only sent by some firmware versions are `Option`.

use serde::{Deserialize, Serialize};

/// Value of a servo's forward channel when forwarding is disabled
pub const SERVO_FORWARD_DISABLED: u8 = 255;

/// iNav MSP_NAV_POSHOLD
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionHold {
    pub user_control_mode: u8,
    /// m/s
    pub max_speed: f64,
    pub max_climb_rate: f64,
    pub max_manual_speed: f64,
    pub max_manual_climb_rate: f64,
    /// Degrees
    pub max_bank_angle: u8,
    pub use_throttle_mid_for_alt_hold: bool,
    pub hover_throttle: u16,
}

/// iNav MSP_RTH_AND_LAND_CONFIG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturnToHome {
    /// m
    pub min_distance: f64,
    pub climb_first: bool,
    pub climb_ignore_emergency: bool,
    pub tail_first: bool,
    pub allow_landing: bool,
    pub alt_control_mode: u8,
    /// m
    pub abort_threshold: f64,
    pub altitude: f64,
    /// m/s
    pub land_descend_rate: f64,
    /// m
    pub land_slowdown_min_alt: f64,
    pub land_slowdown_max_alt: f64,
    /// m/s
    pub emergency_descend_rate: f64,
}

/// iNav MSP_FW_CONFIG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedWing {
    pub cruise_throttle: u16,
    pub min_throttle: u16,
    pub max_throttle: u16,
    /// Degrees
    pub max_bank_angle: u8,
    pub max_climb_angle: u8,
    pub max_dive_angle: u8,
    pub pitch_to_throttle: u8,
    /// m
    pub loiter_radius: f64,
}

/// MSP_BATTERY_CONFIG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// Volts per cell
    pub min_cell_voltage: f64,
    pub max_cell_voltage: f64,
    pub warning_cell_voltage: f64,
    /// mAh
    pub capacity: u16,
    pub voltage_meter_source: u8,
    pub current_meter_source: u8,
}

/// MSP_VOLTAGE_METER_CONFIG
///
/// Betaflight reports a meter id; older firmware sends only the scale and
/// divider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltageMeter {
    pub id: Option<u8>,
    pub scale: u8,
    pub divider_value: u8,
    pub divider_multiplier: u8,
    pub meter_type: Option<u8>,
}

/// MSP_CURRENT_METER_CONFIG
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentMeter {
    pub id: Option<u8>,
    pub meter_type: u8,
    pub scale: i16,
    pub offset: i16,
    /// mAh, legacy layout only
    pub capacity: Option<i16>,
}

/// MSP_RX_CONFIG
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RxConfig {
    pub serial_rx_type: u8,
    /// µs
    pub max_check: u16,
    pub mid_rc: u16,
    pub min_check: u16,
    pub spektrum_sat_bind: u8,
    pub rx_min_usec: Option<u16>,
    pub rx_max_usec: Option<u16>,
    pub rc_interpolation: Option<u8>,
    pub rc_interpolation_interval: Option<u8>,
    pub airmode_activate_threshold: Option<u16>,
    pub spi_protocol: Option<u8>,
    pub spi_id: Option<u32>,
    pub spi_channel_count: Option<u8>,
    /// Degrees
    pub fpv_cam_angle: Option<u8>,
}

/// MSP_BOARD_ALIGNMENT, decidegrees
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardAlignment {
    pub roll: i16,
    pub pitch: i16,
    pub yaw: i16,
}

/// MSP_MOTOR_CONFIG, µs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    pub min_throttle: i16,
    pub max_throttle: i16,
    pub min_command: i16,
}

/// MSP_GPS_CONFIG
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub provider: u8,
    pub ubx_sbas: u8,
    pub auto_config: bool,
    pub auto_baud: bool,
}

/// MSP_RC_DEADBAND
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcDeadband {
    pub deadband: u8,
    pub yaw_deadband: u8,
    pub alt_hold_deadband: u8,
    pub throttle_3d_deadband: Option<i16>,
}

/// MSP_ADVANCED_CONFIG
///
/// The two trailing fields mean different things on iNav and Betaflight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub gyro_sync_denom: u8,
    pub pid_process_denom: u8,
    pub unsynced_pwm: bool,
    pub pwm_protocol: u8,
    /// Hz
    pub pwm_rate: u16,
    /// iNav only, Hz
    pub servo_pwm_rate: Option<u16>,
    /// Betaflight only, percent
    pub digital_idle_offset: Option<f64>,
    /// iNav only
    pub sync_loop_with_gyro: Option<bool>,
    /// Betaflight only
    pub gyro_uses_32khz: Option<bool>,
}

/// MSP_FILTER_CONFIG, Hz
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub gyro_lpf: u8,
    pub dterm_lpf: u16,
    pub yaw_lpf: u16,
    pub gyro_notch_hz: u16,
    pub gyro_notch_cutoff: u16,
    pub dterm_notch_hz: u16,
    pub dterm_notch_cutoff: u16,
    pub gyro_notch_hz2: Option<u16>,
    pub gyro_notch_cutoff2: Option<u16>,
    pub dterm_filter_type: Option<u8>,
}

/// One entry of MSP_CF_SERIAL_CONFIG
///
/// Baud rates are indices into the firmware's baud rate table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialPort {
    pub id: u8,
    /// Bitmask of port functions (MSP, GPS, telemetry, RX, ...)
    pub functions: u16,
    pub msp_baud: u8,
    pub gps_baud: u8,
    pub telemetry_baud: u8,
    pub blackbox_baud: u8,
}

/// One entry of MSP_SERVO_CONFIGURATIONS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    /// µs
    pub min: i16,
    pub max: i16,
    pub middle: i16,
    /// Percent, signed
    pub rate: i8,
    pub min_angle: u8,
    pub max_angle: u8,
    /// `None` when forwarding is disabled
    pub forward_channel: Option<u8>,
    pub reversed_sources: u32,
}

/// Failsafe behaviour of one receiver channel (MSP_RXFAIL_CONFIG)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RxFailChannel {
    pub mode: u8,
    /// µs
    pub value: u16,
}

/// MSP_OSD_CONFIG header
///
/// Element positions and stats follow the header on the wire but their
/// count depends on the firmware's element table; they are not kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Osd {
    pub supported: bool,
    pub video_mode: u8,
    pub unit_mode: Option<u8>,
    pub rssi_alarm: Option<u8>,
    /// mAh
    pub capacity_alarm: Option<i16>,
    pub minutes_alarm: Option<i16>,
    /// m
    pub altitude_alarm: Option<i16>,
}

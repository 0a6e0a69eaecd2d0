//! Telemetry records: values the flight controller streams continuously

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// MSP_STATUS / MSP_STATUS_EX
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    /// Main loop period (µs)
    pub cycle_time: u16,
    pub i2c_errors: u16,
    /// Bitmask of detected sensors (acc, baro, mag, gps, sonar)
    pub active_sensors: u16,
    /// One bit per box, in MSP_BOXIDS order
    pub mode_flags: u32,
    pub profile: u8,
    /// CPU load (%), 0 when the firmware does not report it
    pub system_load: u16,
    pub rate_profile: u8,
    /// iNav arming flags
    pub arming_flags: u16,
    pub acc_calibration_axis: u8,
}

/// Sensor presence bits in `Status::active_sensors`
pub mod sensor {
    pub const ACC: u16 = 1 << 0;
    pub const BARO: u16 = 1 << 1;
    pub const MAG: u16 = 1 << 2;
    pub const GPS: u16 = 1 << 3;
    pub const SONAR: u16 = 1 << 4;
}

impl Status {
    pub fn has_sensor(&self, mask: u16) -> bool {
        self.active_sensors & mask != 0
    }
}

/// MSP_RAW_IMU, scaled to g, deg/s and gauss
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Imu {
    pub accelerometer: [f64; 3],
    pub gyroscope: [f64; 3],
    pub magnetometer: [f64; 3],
}

/// MSP_ATTITUDE (degrees) plus derived turn rate (deg/s)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub heading: f64,
    pub turn_rate: f64,
    #[serde(skip)]
    heading_at: Option<Instant>,
}

impl PartialEq for Attitude {
    fn eq(&self, other: &Self) -> bool {
        self.roll == other.roll
            && self.pitch == other.pitch
            && self.heading == other.heading
            && self.turn_rate == other.turn_rate
    }
}

/// Signed difference `to - from` wrapped into [-180, 180)
pub fn heading_delta(from: f64, to: f64) -> f64 {
    (to - from + 540.0).rem_euclid(360.0) - 180.0
}

impl Attitude {
    /// Apply a new sample; the turn rate is a 50/50 blend of the previous
    /// estimate and the rate since the last heading
    pub fn update(&mut self, roll: f64, pitch: f64, heading: f64, now: Instant) {
        if let Some(previous) = self.heading_at {
            let dt = now.saturating_duration_since(previous).as_secs_f64();
            if dt > 0.0 {
                let rate = heading_delta(self.heading, heading) / dt;
                self.turn_rate = (self.turn_rate + rate) / 2.0;
            }
        }
        self.roll = roll;
        self.pitch = pitch;
        self.heading = heading;
        self.heading_at = Some(now);
    }
}

/// MSP_ALTITUDE (m, m/s) and MSP_SONAR (cm)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Altitude {
    pub altitude: f64,
    pub variometer: f64,
    /// Running maximum of `altitude`
    pub max_altitude: f64,
    pub sonar: i32,
}

impl Altitude {
    pub fn update(&mut self, altitude: f64, variometer: f64) {
        self.altitude = altitude;
        self.variometer = variometer;
        self.max_altitude = self.max_altitude.max(altitude);
    }
}

/// MSP_ANALOG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Battery {
    /// Volts
    pub voltage: f64,
    pub mah_drawn: u16,
    /// Receiver RSSI (%)
    pub rssi: u16,
    /// Amps
    pub amperage: f64,
    pub max_amperage: f64,
}

/// One entry of MSP_GPSSVINFO
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Satellite {
    pub channel: u8,
    pub svid: u8,
    pub quality: u8,
    /// Carrier to noise ratio (dB)
    pub cno: u8,
}

/// Decoded MSP_RAW_GPS
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpsFix {
    pub fix: bool,
    pub num_sats: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: u16,
    pub speed: f64,
    pub heading: f64,
}

/// GPS position, home vector and statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gps {
    pub fix: bool,
    pub num_sats: u8,
    /// Degrees
    pub latitude: f64,
    pub longitude: f64,
    /// Meters
    pub altitude: u16,
    /// km/h
    pub speed: f64,
    /// Course over ground (degrees)
    pub heading: f64,
    /// MSP_COMP_GPS (m, degrees)
    pub distance_to_home: u16,
    pub direction_to_home: u16,
    pub update: u8,
    pub satellites: Vec<Satellite>,

    pub last_known_good_latitude: f64,
    pub last_known_good_longitude: f64,
    pub last_known_good_altitude: u16,
    pub max_altitude: u16,
    pub max_speed: f64,
    pub max_distance_to_home: u16,
}

impl Gps {
    /// Apply MSP_RAW_GPS. History is only tracked while the receiver has a fix
    pub fn apply_fix(&mut self, sample: GpsFix) {
        self.fix = sample.fix;
        self.num_sats = sample.num_sats;
        self.latitude = sample.latitude;
        self.longitude = sample.longitude;
        self.altitude = sample.altitude;
        self.speed = sample.speed;
        self.heading = sample.heading;

        if self.fix {
            // A zero coordinate is what receivers report before the first solution
            if self.latitude != 0.0 && self.longitude != 0.0 {
                self.last_known_good_latitude = self.latitude;
                self.last_known_good_longitude = self.longitude;
            }
            self.last_known_good_altitude = self.altitude;
            self.max_altitude = self.max_altitude.max(self.altitude);
            self.max_speed = self.max_speed.max(self.speed);
        }
    }

    /// Apply MSP_COMP_GPS
    pub fn apply_home_vector(&mut self, distance: u16, direction: u16, update: u8) {
        self.distance_to_home = distance;
        self.direction_to_home = direction;
        self.update = update;
        if self.fix {
            self.max_distance_to_home = self.max_distance_to_home.max(distance);
        }
    }
}

/// MSP_RC and MSP_RX_MAP
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Receiver {
    /// Channel values (µs)
    pub channels: Vec<u16>,
    pub map: Vec<u8>,
}

/// MSP_MOTOR and MSP_SERVO
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Motors {
    pub motors: Vec<u16>,
    /// Motors with a non-zero output
    pub active_motors: usize,
    pub servos: Vec<u16>,
}

/// MSP_SIKRADIO
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Radio {
    pub rx_errors: u16,
    pub fixed_errors: u16,
    pub rssi: u8,
    pub remote_rssi: u8,
    pub tx_buffer: u8,
    pub noise: u8,
    pub remote_noise: u8,
}

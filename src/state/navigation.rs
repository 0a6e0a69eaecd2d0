//! Waypoints and navigation status

use serde::{Deserialize, Serialize};

/// Waypoint number of the home position
pub const HOME_WAYPOINT: u8 = 0;
/// Position hold waypoint on MultiWii/Cleanflight
pub const POSHOLD_WAYPOINT: u8 = 16;
/// Position hold waypoint on iNav
pub const INAV_POSHOLD_WAYPOINT: u8 = 255;
/// Marker byte flagging the last waypoint of an iNav mission
pub const LAST_WAYPOINT_FLAG: u8 = 0xA5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// The firmware reports (0, 0) for "not set"
    pub fn is_set(&self) -> bool {
        self.latitude != 0.0 || self.longitude != 0.0
    }
}

/// iNav waypoint action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaypointAction {
    Waypoint,
    ReturnToHome,
    Other(u8),
}

impl From<u8> for WaypointAction {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Waypoint,
            4 => Self::ReturnToHome,
            other => Self::Other(other),
        }
    }
}

impl From<WaypointAction> for u8 {
    fn from(action: WaypointAction) -> u8 {
        match action {
            WaypointAction::Waypoint => 1,
            WaypointAction::ReturnToHome => 4,
            WaypointAction::Other(v) => v,
        }
    }
}

/// iNav mission waypoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub number: u8,
    pub action: WaypointAction,
    pub position: GeoPoint,
    /// Meters
    pub altitude: f64,
    pub param1: i16,
    pub param2: i16,
    pub param3: i16,
    pub last: bool,
}

/// iNav sensor health (MSP_SENSOR_STATUS)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorHealth {
    pub hardware_healthy: bool,
    pub gyro: u8,
    pub accelerometer: u8,
    pub magnetometer: u8,
    pub barometer: u8,
    pub gps: u8,
    pub rangefinder: u8,
    pub pitot: u8,
    pub optical_flow: u8,
}

/// Home, hold position, mission and navigation state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Navigation {
    pub home: Option<GeoPoint>,
    pub position_hold: Option<GeoPoint>,
    /// Meters
    pub altitude_hold: f64,
    /// Degrees
    pub heading_hold: f64,
    /// Mission in waypoint number order
    pub waypoints: Vec<Waypoint>,

    // MSP_NAV_STATUS
    pub nav_mode: u8,
    pub nav_state: u8,
    pub active_waypoint_action: u8,
    pub active_waypoint: u8,
    pub nav_error: u8,

    // MSP_WP_GETINFO
    pub max_waypoints: u8,
    pub mission_valid: bool,
    pub waypoint_count: u8,

    pub sensors: SensorHealth,
}

impl Navigation {
    /// Insert or replace a mission waypoint, keeping number order
    pub fn set_waypoint(&mut self, waypoint: Waypoint) {
        match self
            .waypoints
            .binary_search_by_key(&waypoint.number, |w| w.number)
        {
            Ok(i) => self.waypoints[i] = waypoint,
            Err(i) => self.waypoints.insert(i, waypoint),
        }
    }

    /// True once the waypoint flagged as last has been received
    pub fn mission_complete(&self) -> bool {
        self.waypoints.last().is_some_and(|w| w.last)
    }
}

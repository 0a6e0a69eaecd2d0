//! Vehicle state shared between the dispatcher and observers
//!
//! One `VehicleState` per connected aircraft, handed around as
//! `Arc<VehicleState>`. Each topic record sits behind its own lock; the
//! dispatcher is the only writer and replaces a record's fields only after
//! the whole message has been decoded, so readers never see half a message.
//! Consistency across records is not guaranteed.
//!
//! State survives reconnects. Only [`VehicleState::reset`] clears it.

mod config;
mod navigation;
mod settings;
mod telemetry;

pub use config::{
    AdvancedConfig, BatteryConfig, BoardAlignment, CurrentMeter, FilterConfig, FixedWing,
    GpsConfig, MotorConfig, Osd, PositionHold, RcDeadband, ReturnToHome, RxConfig,
    RxFailChannel, SerialPort, ServoConfig, VoltageMeter, SERVO_FORWARD_DISABLED,
};
pub use navigation::{
    GeoPoint, Navigation, SensorHealth, Waypoint, WaypointAction, HOME_WAYPOINT,
    INAV_POSHOLD_WAYPOINT, LAST_WAYPOINT_FLAG, POSHOLD_WAYPOINT,
};
pub use settings::{
    mode, Failsafe, Identity, Misc, ModeRange, RcTuning, Settings, Storage, Vtx, INAV_VARIANT,
    MODE_RANGE_BASE, MODE_RANGE_STEP,
};
pub use telemetry::{
    heading_delta, sensor, Altitude, Attitude, Battery, Gps, GpsFix, Imu, Motors, Radio,
    Receiver, Satellite, Status,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Schema version written with every snapshot
pub const SNAPSHOT_VERSION: u32 = 1;

/// All records of one aircraft
#[derive(Debug, Default)]
pub struct VehicleState {
    pub identity: RwLock<Identity>,
    pub status: RwLock<Status>,
    pub imu: RwLock<Imu>,
    pub attitude: RwLock<Attitude>,
    pub altitude: RwLock<Altitude>,
    pub battery: RwLock<Battery>,
    pub gps: RwLock<Gps>,
    pub receiver: RwLock<Receiver>,
    pub motors: RwLock<Motors>,
    pub settings: RwLock<Settings>,
    pub navigation: RwLock<Navigation>,
    pub storage: RwLock<Storage>,
    pub radio: RwLock<Radio>,
}

/// Owned copy of every record, used for flight log headers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSnapshot {
    pub version: u32,
    pub identity: Identity,
    pub status: Status,
    pub imu: Imu,
    pub attitude: Attitude,
    pub altitude: Altitude,
    pub battery: Battery,
    pub gps: Gps,
    pub receiver: Receiver,
    pub motors: Motors,
    pub settings: Settings,
    pub navigation: Navigation,
    pub storage: Storage,
    pub radio: Radio,
}

impl VehicleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every record, one lock at a time
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            identity: self.identity.read().clone(),
            status: self.status.read().clone(),
            imu: self.imu.read().clone(),
            attitude: self.attitude.read().clone(),
            altitude: self.altitude.read().clone(),
            battery: self.battery.read().clone(),
            gps: self.gps.read().clone(),
            receiver: self.receiver.read().clone(),
            motors: self.motors.read().clone(),
            settings: self.settings.read().clone(),
            navigation: self.navigation.read().clone(),
            storage: self.storage.read().clone(),
            radio: self.radio.read().clone(),
        }
    }

    /// Overwrite every record from a snapshot (flight log replay)
    pub fn restore(&self, snapshot: StateSnapshot) {
        *self.identity.write() = snapshot.identity;
        *self.status.write() = snapshot.status;
        *self.imu.write() = snapshot.imu;
        *self.attitude.write() = snapshot.attitude;
        *self.altitude.write() = snapshot.altitude;
        *self.battery.write() = snapshot.battery;
        *self.gps.write() = snapshot.gps;
        *self.receiver.write() = snapshot.receiver;
        *self.motors.write() = snapshot.motors;
        *self.settings.write() = snapshot.settings;
        *self.navigation.write() = snapshot.navigation;
        *self.storage.write() = snapshot.storage;
        *self.radio.write() = snapshot.radio;
    }

    /// Back to factory defaults
    pub fn reset(&self) {
        self.restore(StateSnapshot::default());
    }

    /// Whether the ARM box is active in the last status
    pub fn is_armed(&self) -> bool {
        let flags = self.status.read().mode_flags;
        self.settings.read().is_mode_active(flags, mode::ARM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_restore() {
        let state = VehicleState::new();
        state.gps.write().latitude = 48.85;
        state.identity.write().fc_variant = "BTFL".into();

        let snap = state.snapshot();
        assert_eq!(snap.version, SNAPSHOT_VERSION);

        let other = VehicleState::new();
        other.restore(snap.clone());
        assert_eq!(other.snapshot(), snap);
    }

    #[test]
    fn test_snapshot_serde() {
        let state = VehicleState::new();
        state.battery.write().voltage = 12.6;
        state.settings.write().box_names = vec!["ARM".into(), "ANGLE".into()];
        let json = serde_json::to_string(&state.snapshot()).unwrap();
        let back: StateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.battery.voltage, 12.6);
        assert_eq!(back.settings.box_names.len(), 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let state = VehicleState::new();
        state.altitude.write().update(100.0, 1.0);
        state.motors.write().active_motors = 4;
        state.reset();
        assert_eq!(state.altitude.read().max_altitude, 0.0);
        assert_eq!(state.motors.read().active_motors, 0);
    }

    #[test]
    fn test_is_armed() {
        let state = VehicleState::new();
        state.settings.write().box_ids = vec![mode::ANGLE, mode::ARM];
        state.status.write().mode_flags = 0b10;
        assert!(state.is_armed());
        state.status.write().mode_flags = 0b01;
        assert!(!state.is_armed());
    }
}

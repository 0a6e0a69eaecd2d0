//! Vehicle facade for front ends
//!
//! [`Vehicle`] tags what is on the other end of a link, and
//! [`FlightControl`] is the set of operations a front end may use on any of
//! them. A live MSP vehicle is commanded through RC override: arming and
//! mode switches move the aux channel into the range configured for that
//! mode. A replayed flight only reports telemetry.

use crate::error::{LinkError, Result};
use crate::link::MspLink;
use crate::msp::commands;
use crate::state::{mode, GeoPoint, ModeRange, VehicleState, MODE_RANGE_STEP};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Channels sent in RC override frames (AETR + 4 aux)
pub const RC_CHANNELS: usize = 8;
/// Index of the first aux channel
const FIRST_AUX: usize = 4;
const THROTTLE: usize = 3;
const RC_MID: u16 = 1500;
const RC_LOW: u16 = 1000;
const RC_HIGH: u16 = 2000;

/// Values a front end displays, read in one go
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    pub connected: bool,
    pub armed: bool,
    pub replaying: bool,
    /// Degrees
    pub roll: f64,
    pub pitch: f64,
    pub heading: f64,
    /// Degrees per second
    pub turn_rate: f64,
    /// km/h
    pub speed: f64,
    /// Meters
    pub altitude: f64,
    /// m/s
    pub vertical_speed: f64,
    /// %
    pub rssi: u16,
    pub gps_fix: bool,
    pub num_sats: u8,
    /// Meters
    pub distance_to_home: u16,
    pub battery_volts: f64,
    pub battery_amps: f64,
    pub battery_mah: u16,
}

impl Telemetry {
    /// Read every displayed value from `state`
    pub fn collect(state: &VehicleState) -> Self {
        let attitude = state.attitude.read().clone();
        let altitude = state.altitude.read().clone();
        let battery = state.battery.read().clone();
        let (gps_fix, num_sats, speed, distance_to_home) = {
            let gps = state.gps.read();
            (gps.fix, gps.num_sats, gps.speed, gps.distance_to_home)
        };

        Self {
            connected: false,
            armed: state.is_armed(),
            replaying: false,
            roll: attitude.roll,
            pitch: attitude.pitch,
            heading: attitude.heading,
            turn_rate: attitude.turn_rate,
            speed,
            altitude: altitude.altitude,
            vertical_speed: altitude.variometer,
            rssi: battery.rssi,
            gps_fix,
            num_sats,
            distance_to_home,
            battery_volts: battery.voltage,
            battery_amps: battery.amperage,
            battery_mah: battery.mah_drawn,
        }
    }
}

/// Switchable flight modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightMode {
    Angle,
    Horizon,
    AltitudeHold,
    HeadingHold,
    ReturnToHome,
    PositionHold,
}

impl FlightMode {
    /// Box id of the mode
    pub fn mode_id(self) -> u8 {
        match self {
            Self::Angle => mode::ANGLE,
            Self::Horizon => mode::HORIZON,
            Self::AltitudeHold => mode::BARO,
            Self::HeadingHold => mode::MAG,
            Self::ReturnToHome => mode::GPS_HOME,
            Self::PositionHold => mode::GPS_HOLD,
        }
    }
}

/// Operations every kind of vehicle offers
pub trait FlightControl {
    fn telemetry(&self) -> Telemetry;

    fn arm(&self, armed: bool) -> Result<()>;

    fn set_flight_mode(&self, mode: FlightMode, active: bool) -> Result<()>;

    /// Fly to `target` and hold there
    fn navigate_to(&self, target: GeoPoint, altitude: f64) -> Result<()>;
}

/// What is on the other end of a link
#[derive(Debug)]
pub enum Vehicle {
    /// Flight controller answering over MSP
    Msp(MspVehicle),
    /// Recorded MSP flight being played back
    Replay(ReplayVehicle),
}

impl Vehicle {
    pub fn link(&self) -> &Arc<MspLink> {
        match self {
            Self::Msp(v) => &v.link,
            Self::Replay(v) => &v.link,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replay(_))
    }
}

impl FlightControl for Vehicle {
    fn telemetry(&self) -> Telemetry {
        match self {
            Self::Msp(v) => v.telemetry(),
            Self::Replay(v) => v.telemetry(),
        }
    }

    fn arm(&self, armed: bool) -> Result<()> {
        match self {
            Self::Msp(v) => v.arm(armed),
            Self::Replay(v) => v.arm(armed),
        }
    }

    fn set_flight_mode(&self, mode: FlightMode, active: bool) -> Result<()> {
        match self {
            Self::Msp(v) => v.set_flight_mode(mode, active),
            Self::Replay(v) => v.set_flight_mode(mode, active),
        }
    }

    fn navigate_to(&self, target: GeoPoint, altitude: f64) -> Result<()> {
        match self {
            Self::Msp(v) => v.navigate_to(target, altitude),
            Self::Replay(v) => v.navigate_to(target, altitude),
        }
    }
}

// =============================================================================
// Live MSP vehicle
// =============================================================================

/// Live flight controller commanded through RC override
#[derive(Debug)]
pub struct MspVehicle {
    link: Arc<MspLink>,
    rc: Mutex<[u16; RC_CHANNELS]>,
}

impl MspVehicle {
    pub fn new(link: Arc<MspLink>) -> Self {
        let mut rc = [RC_MID; RC_CHANNELS];
        rc[THROTTLE] = RC_LOW;
        for aux in &mut rc[FIRST_AUX..] {
            *aux = RC_LOW;
        }
        Self {
            link,
            rc: Mutex::new(rc),
        }
    }

    /// Current RC override values
    pub fn rc_channels(&self) -> [u16; RC_CHANNELS] {
        *self.rc.lock()
    }

    /// Move the aux channel of `mode_id` in or out of its range and send
    fn switch(&self, mode_id: u8, active: bool) -> Result<()> {
        if !self.link.is_connected() {
            return Err(LinkError::LinkClosed);
        }
        let range = self
            .link
            .state()
            .settings
            .read()
            .mode_ranges
            .iter()
            .find(|r| r.mode_id == mode_id && r.end > r.start)
            .copied()
            .ok_or(LinkError::NoModeRange { mode_id })?;

        let channel = FIRST_AUX + range.aux_channel as usize;
        if channel >= RC_CHANNELS {
            return Err(LinkError::NoModeRange { mode_id });
        }

        let channels = {
            let mut rc = self.rc.lock();
            rc[channel] = switch_value(&range, active);
            *rc
        };
        self.link.send_command(commands::raw_rc(&channels), None)
    }
}

/// Pulse width inside the range when `active`, outside it otherwise
fn switch_value(range: &ModeRange, active: bool) -> u16 {
    if active {
        range.start + (range.end - range.start) / 2
    } else if range.start > RC_LOW {
        RC_LOW
    } else if range.end < RC_HIGH {
        RC_HIGH
    } else {
        // Range covers the whole stick travel
        range.start.saturating_sub(MODE_RANGE_STEP)
    }
}

impl FlightControl for MspVehicle {
    fn telemetry(&self) -> Telemetry {
        Telemetry {
            connected: self.link.is_connected(),
            ..Telemetry::collect(self.link.state())
        }
    }

    fn arm(&self, armed: bool) -> Result<()> {
        info!("{} requested", if armed { "Arming" } else { "Disarming" });
        self.switch(mode::ARM, armed)
    }

    fn set_flight_mode(&self, mode: FlightMode, active: bool) -> Result<()> {
        self.switch(mode.mode_id(), active)
    }

    fn navigate_to(&self, target: GeoPoint, altitude: f64) -> Result<()> {
        if !self.link.is_connected() {
            return Err(LinkError::LinkClosed);
        }
        let is_inav = self.link.state().identity.read().is_inav();
        self.link
            .send_command(commands::gps_hold(is_inav, target, altitude), None)
    }
}

// =============================================================================
// Replay
// =============================================================================

/// Recorded flight; telemetry only
#[derive(Debug)]
pub struct ReplayVehicle {
    link: Arc<MspLink>,
}

impl ReplayVehicle {
    pub fn new(link: Arc<MspLink>) -> Self {
        Self { link }
    }
}

impl FlightControl for ReplayVehicle {
    fn telemetry(&self) -> Telemetry {
        Telemetry {
            connected: self.link.is_connected(),
            replaying: true,
            ..Telemetry::collect(self.link.state())
        }
    }

    fn arm(&self, _armed: bool) -> Result<()> {
        Err(LinkError::ReadOnly)
    }

    fn set_flight_mode(&self, _mode: FlightMode, _active: bool) -> Result<()> {
        Err(LinkError::ReadOnly)
    }

    fn navigate_to(&self, _target: GeoPoint, _altitude: f64) -> Result<()> {
        Err(LinkError::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msp::MspCode;

    fn vehicle_with_ranges() -> MspVehicle {
        let link = MspLink::new(Arc::new(VehicleState::new()));
        link.opened();
        link.state().settings.write().mode_ranges = vec![
            ModeRange::from_steps(mode::ARM, 0, 32, 48),
            ModeRange::from_steps(mode::GPS_HOLD, 2, 0, 16),
        ];
        MspVehicle::new(link)
    }

    fn sent_rc(vehicle: &MspVehicle) -> Vec<u16> {
        let frame = vehicle.link.next_output_chunk().unwrap();
        assert_eq!(frame[4], MspCode::SetRawRc.id());
        frame[5..5 + frame[3] as usize]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[tokio::test]
    async fn test_arm_moves_aux_into_range() {
        let vehicle = vehicle_with_ranges();
        vehicle.arm(true).unwrap();
        let rc = sent_rc(&vehicle);
        // ARM range is 1700..2100 on AUX1
        assert_eq!(rc[4], 1900);
        assert_eq!(rc[THROTTLE], RC_LOW);

        vehicle.arm(false).unwrap();
        assert_eq!(sent_rc(&vehicle)[4], RC_LOW);
    }

    #[tokio::test]
    async fn test_mode_range_at_bottom_switches_off_high() {
        let vehicle = vehicle_with_ranges();
        vehicle.set_flight_mode(FlightMode::PositionHold, true).unwrap();
        assert_eq!(vehicle.rc_channels()[6], 1100);
        vehicle
            .set_flight_mode(FlightMode::PositionHold, false)
            .unwrap();
        assert_eq!(vehicle.rc_channels()[6], RC_HIGH);
    }

    #[tokio::test]
    async fn test_unconfigured_mode() {
        let vehicle = vehicle_with_ranges();
        assert!(matches!(
            vehicle.set_flight_mode(FlightMode::Horizon, true),
            Err(LinkError::NoModeRange { mode_id }) if mode_id == mode::HORIZON
        ));
    }

    #[tokio::test]
    async fn test_disconnected_vehicle_rejects_commands() {
        let vehicle = vehicle_with_ranges();
        vehicle.link.closed();
        assert!(matches!(vehicle.arm(true), Err(LinkError::LinkClosed)));
        assert!(matches!(
            vehicle.navigate_to(GeoPoint::new(1.0, 2.0), 10.0),
            Err(LinkError::LinkClosed)
        ));
    }

    #[tokio::test]
    async fn test_navigate_uses_firmware_layout() {
        let vehicle = vehicle_with_ranges();
        vehicle.link.state().identity.write().fc_variant = "INAV".into();
        vehicle
            .navigate_to(GeoPoint::new(45.0, 7.0), 30.0)
            .unwrap();
        let frame = vehicle.link.next_output_chunk().unwrap();
        assert_eq!(frame[4], MspCode::SetWp.id());
        assert_eq!(frame[3], 21);
        assert_eq!(frame[5], 255);
    }

    #[tokio::test]
    async fn test_replay_is_read_only() {
        let link = MspLink::new(Arc::new(VehicleState::new()));
        link.state().gps.write().num_sats = 7;
        let vehicle = Vehicle::Replay(ReplayVehicle::new(link));
        assert!(vehicle.is_replay());
        assert!(matches!(vehicle.arm(true), Err(LinkError::ReadOnly)));

        let telemetry = vehicle.telemetry();
        assert!(telemetry.replaying);
        assert_eq!(telemetry.num_sats, 7);
    }

    #[test]
    fn test_switch_value_full_travel() {
        let range = ModeRange {
            mode_id: mode::ANGLE,
            aux_channel: 0,
            start: 900,
            end: 2100,
        };
        assert_eq!(switch_value(&range, false), 875);
    }
}

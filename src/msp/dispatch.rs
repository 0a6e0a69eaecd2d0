//! Message dispatcher
//!
//! Maps a decoded frame to the vehicle state record it describes. Every
//! decoder checks the minimum length of its message, decodes all fields into
//! locals and only then takes the record lock, so a short or malformed
//! payload never leaves a record half written.
//!
//! Scalings are fixed by the firmware and must not change.

use super::code::MspCode;
use super::payload::{name_list, require, PayloadReader};
use crate::broadcast::{Category, CategorySet};
use crate::state::{
    self, GeoPoint, GpsFix, ModeRange, Satellite, VehicleState, Waypoint, WaypointAction,
    HOME_WAYPOINT, INAV_POSHOLD_WAYPOINT, POSHOLD_WAYPOINT, SERVO_FORWARD_DISABLED,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Receiver channels kept from MSP_RC
pub const MAX_RC_CHANNELS: usize = 18;
/// Entries kept from MSP_RX_MAP
pub const MAX_RX_MAP: usize = 8;
/// Motor and servo slots in MSP_MOTOR / MSP_SERVO
pub const OUTPUT_SLOTS: usize = 8;

/// Why a frame could not be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Payload shorter than the message layout
    TooShort { expected: usize, actual: usize },
    /// Payload length or content inconsistent with the layout
    Malformed { reason: &'static str },
    /// Id outside the code table
    Unhandled { code: u8 },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { expected, actual } => {
                write!(f, "payload too short: {} bytes, need {}", actual, expected)
            }
            Self::Malformed { reason } => write!(f, "malformed payload: {}", reason),
            Self::Unhandled { code } => write!(f, "no handler for code {}", code),
        }
    }
}

type Dispatched = Result<CategorySet, DispatchError>;

/// Writes decoded messages into a `VehicleState`
#[derive(Debug, Clone)]
pub struct Dispatcher {
    state: Arc<VehicleState>,
}

impl Dispatcher {
    pub fn new(state: Arc<VehicleState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<VehicleState> {
        &self.state
    }

    /// Dispatch by raw id
    pub fn dispatch_id(&self, id: u8, payload: &[u8]) -> Dispatched {
        let code = MspCode::try_from(id).map_err(|code| DispatchError::Unhandled { code })?;
        self.dispatch(code, payload)
    }

    /// Apply one message
    ///
    /// Returns the categories whose records changed. Acknowledgements and
    /// codes with no modelled state succeed with an empty set.
    pub fn dispatch(&self, code: MspCode, p: &[u8]) -> Dispatched {
        use MspCode::*;

        match code {
            Ident => self.ident(p),
            Status | StatusEx => self.status(p),
            RawImu => self.raw_imu(p),
            Servo => self.servo(p),
            Motor => self.motor(p),
            Rc => self.rc(p),
            RawGps => self.raw_gps(p),
            CompGps => self.comp_gps(p),
            Attitude => self.attitude(p),
            Altitude => self.altitude(p),
            Sonar => self.sonar(p),
            Analog => self.analog(p),
            RcTuning => self.rc_tuning(p),
            Pid => self.pid(p),
            ArmingConfig => self.arming_config(p),
            Misc => self.misc(p),
            BoxNames => {
                self.state.settings.write().box_names = name_list(p);
                Ok(Category::Settings.into())
            }
            PidNames => {
                self.state.settings.write().pid_names = name_list(p);
                Ok(Category::Settings.into())
            }
            BoxIds => {
                self.state.settings.write().box_ids = p.to_vec();
                Ok(Category::Settings.into())
            }
            ModeRanges => self.mode_ranges(p),
            Wp => self.waypoint(p),
            GpsSvInfo => self.gps_sv_info(p),
            FailsafeConfig => self.failsafe_config(p),
            RxMap => {
                let map: Vec<u8> = p.iter().take(MAX_RX_MAP).copied().collect();
                self.state.receiver.write().map = map;
                Ok(Category::Receiver.into())
            }
            LoopTime => {
                require(p, 2)?;
                let loop_time = PayloadReader::new(p).u16()?;
                self.state.settings.write().loop_time = loop_time;
                Ok(Category::Settings.into())
            }
            PidController => {
                require(p, 1)?;
                self.state.settings.write().pid_controller = p[0];
                Ok(Category::Settings.into())
            }
            ApiVersion => self.api_version(p),
            FcVariant => {
                require(p, 4)?;
                let variant = PayloadReader::new(p).text(4)?;
                self.state.identity.write().fc_variant = variant;
                Ok(Category::Identity.into())
            }
            FcVersion => {
                require(p, 3)?;
                let version = format!("{}.{}.{}", p[0], p[1], p[2]);
                self.state.identity.write().fc_version = version;
                Ok(Category::Identity.into())
            }
            BuildInfo => self.build_info(p),
            BoardInfo => self.board_info(p),
            Uid => self.uid(p),
            Name => {
                let name = PayloadReader::new(p).text(p.len())?;
                self.state.identity.write().craft_name = name;
                Ok(Category::Identity.into())
            }
            AccTrim => {
                require(p, 4)?;
                let mut r = PayloadReader::new(p);
                let pitch = r.i16()?;
                let roll = r.i16()?;
                let mut settings = self.state.settings.write();
                settings.acc_trim_pitch = pitch;
                settings.acc_trim_roll = roll;
                Ok(Category::Settings.into())
            }
            DataflashSummary => self.dataflash_summary(p),
            // The payload goes to the data request that asked for it
            DataflashRead => Ok(CategorySet::EMPTY),
            SdcardSummary => self.sdcard_summary(p),
            BlackboxConfig => self.blackbox_config(p),
            SikRadio => self.sik_radio(p),
            NavStatus => self.nav_status(p),
            SensorStatus => self.sensor_status(p),
            WpGetInfo => self.wp_get_info(p),
            BeeperConfig => {
                require(p, 4)?;
                let mask = PayloadReader::new(p).u32()?;
                self.state.settings.write().beeper_mask = mask;
                Ok(Category::Settings.into())
            }
            VtxConfig => self.vtx_config(p),
            Feature => {
                require(p, 4)?;
                let features = PayloadReader::new(p).u32()?;
                self.state.settings.write().features = features;
                Ok(Category::Settings.into())
            }
            MixerConfig => {
                require(p, 1)?;
                let mut settings = self.state.settings.write();
                settings.mixer_type = p[0];
                settings.yaw_motors_reversed = p.get(1).map(|&b| b != 0);
                Ok(Category::Settings.into())
            }
            RssiConfig => {
                require(p, 1)?;
                self.state.settings.write().misc.rssi_channel = p[0];
                Ok(Category::Settings.into())
            }
            CompassConfig => {
                require(p, 2)?;
                let declination = PayloadReader::new(p).i16()? as f64 / 10.0;
                self.state.settings.write().misc.mag_declination = declination;
                Ok(Category::Settings.into())
            }
            BoardAlignment => self.board_alignment(p),
            MotorConfig => self.motor_config(p),
            GpsConfig => self.gps_config(p),
            RcDeadband => self.rc_deadband(p),
            AdvancedConfig => self.advanced_config(p),
            FilterConfig => self.filter_config(p),
            RxConfig => self.rx_config(p),
            RxfailConfig => self.rx_fail_config(p),
            CfSerialConfig => self.serial_config(p),
            ServoConfigurations => self.servo_configurations(p),
            BatteryConfig => self.battery_config(p),
            VoltageMeterConfig => self.voltage_meter_config(p),
            CurrentMeterConfig => self.current_meter_config(p),
            OsdConfig => self.osd_config(p),
            NavPoshold => self.nav_poshold(p),
            RthAndLandConfig => self.rth_and_land_config(p),
            FwConfig => self.fw_config(p),
            code if code.is_acknowledgement() => Ok(CategorySet::EMPTY),
            // Known codes without a modelled record (LED strip, transponder,
            // ESC sensors, display port, debug)
            code => {
                debug!("No state for {} ({} bytes)", code, p.len());
                Ok(CategorySet::EMPTY)
            }
        }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    fn ident(&self, p: &[u8]) -> Dispatched {
        require(p, 7)?;
        let version = format!("{}.{:02}", p[0] / 100, p[0] % 100);
        let mixer = p[1];
        let msp_version = p[2];
        let capability = PayloadReader::new(&p[3..]).u32()?;

        {
            let mut identity = self.state.identity.write();
            identity.multiwii_version = version;
            identity.msp_version = msp_version;
            identity.capability = capability;
        }
        self.state.settings.write().mixer_type = mixer;
        Ok(Category::Identity | Category::Settings)
    }

    fn api_version(&self, p: &[u8]) -> Dispatched {
        require(p, 3)?;
        let version = format!("{}.{}", p[1], p[2]);
        let mut identity = self.state.identity.write();
        identity.msp_protocol_version = p[0];
        identity.api_version = version;
        Ok(Category::Identity.into())
    }

    fn build_info(&self, p: &[u8]) -> Dispatched {
        require(p, 19)?;
        let mut r = PayloadReader::new(p);
        let date = r.text(11)?;
        let time = r.text(8)?;
        self.state.identity.write().build_info = format!("{} {}", date, time);
        Ok(Category::Identity.into())
    }

    fn board_info(&self, p: &[u8]) -> Dispatched {
        require(p, 6)?;
        let mut r = PayloadReader::new(p);
        let board_id = r.text(4)?;
        let board_version = r.u16()?;
        let mut identity = self.state.identity.write();
        identity.board_id = board_id;
        identity.board_version = board_version;
        Ok(Category::Identity.into())
    }

    fn uid(&self, p: &[u8]) -> Dispatched {
        require(p, 12)?;
        let mut r = PayloadReader::new(p);
        let uid = format!("{:04x}{:04x}{:04x}", r.u32()?, r.u32()?, r.u32()?);
        self.state.identity.write().uid = uid;
        Ok(Category::Identity.into())
    }

    // =========================================================================
    // Status and sensors
    // =========================================================================

    fn status(&self, p: &[u8]) -> Dispatched {
        require(p, 11)?;
        let mut r = PayloadReader::new(p);
        let cycle_time = r.u16()?;
        let i2c_errors = r.u16()?;
        let active_sensors = r.u16()?;
        let mode_flags = r.u32()?;
        let profile = r.u8()?;
        let system_load = if p.len() >= 13 { Some(r.u16()?) } else { None };

        let is_inav = self.state.identity.read().is_inav();
        let mut arming_flags = None;
        let mut acc_axis = None;
        let mut rate_profile = None;
        if p.len() >= 15 {
            if is_inav {
                arming_flags = Some(r.u16()?);
                if p.len() >= 16 {
                    acc_axis = Some(r.u8()?);
                }
            } else {
                rate_profile = Some(p[14]);
            }
        }

        let mut status = self.state.status.write();
        let mut changed = CategorySet::from(Category::Status);
        if status.mode_flags != mode_flags {
            changed.insert(Category::FlightMode);
        }
        if status.active_sensors != active_sensors
            || arming_flags.is_some_and(|f| f != status.arming_flags)
        {
            changed.insert(Category::SensorStatus);
        }

        status.cycle_time = cycle_time;
        status.i2c_errors = i2c_errors;
        status.active_sensors = active_sensors;
        status.mode_flags = mode_flags;
        status.profile = profile;
        if let Some(load) = system_load {
            status.system_load = load;
        }
        if let Some(flags) = arming_flags {
            status.arming_flags = flags;
        }
        if let Some(axis) = acc_axis {
            status.acc_calibration_axis = axis;
        }
        if let Some(rate_profile) = rate_profile {
            status.rate_profile = rate_profile;
        }
        Ok(changed)
    }

    fn raw_imu(&self, p: &[u8]) -> Dispatched {
        require(p, 18)?;
        let mut r = PayloadReader::new(p);
        let mut raw = [0i16; 9];
        for v in raw.iter_mut() {
            *v = r.i16()?;
        }

        // 512 LSB/g (MPU6050), 16.4 LSB/(deg/s) at 4x, 1090 LSB/gauss
        let mut imu = self.state.imu.write();
        for axis in 0..3 {
            imu.accelerometer[axis] = raw[axis] as f64 / 512.0;
            imu.gyroscope[axis] = raw[3 + axis] as f64 * (4.0 / 16.4);
            imu.magnetometer[axis] = raw[6 + axis] as f64 / 1090.0;
        }
        Ok(Category::Imu.into())
    }

    fn attitude(&self, p: &[u8]) -> Dispatched {
        require(p, 6)?;
        let mut r = PayloadReader::new(p);
        let roll = r.i16()? as f64 / 10.0;
        let pitch = r.i16()? as f64 / 10.0;
        let heading = r.i16()? as f64;
        self.state
            .attitude
            .write()
            .update(roll, pitch, heading, Instant::now());
        Ok(Category::Attitude.into())
    }

    fn altitude(&self, p: &[u8]) -> Dispatched {
        require(p, 6)?;
        let mut r = PayloadReader::new(p);
        let altitude = r.i32()? as f64 / 100.0;
        let variometer = r.i16()? as f64 / 100.0;
        self.state.altitude.write().update(altitude, variometer);
        Ok(Category::Altitude.into())
    }

    fn sonar(&self, p: &[u8]) -> Dispatched {
        require(p, 4)?;
        let sonar = PayloadReader::new(p).i32()?;
        self.state.altitude.write().sonar = sonar;
        Ok(Category::Sonar.into())
    }

    fn analog(&self, p: &[u8]) -> Dispatched {
        require(p, 7)?;
        let mut r = PayloadReader::new(p);
        let voltage = r.u8()? as f64 / 10.0;
        let mah_drawn = r.u16()?;
        let rssi = (r.u16()? as u32 * 100 / 1023) as u16;
        let amperage = r.i16()? as f64 / 100.0;

        let mut battery = self.state.battery.write();
        battery.voltage = voltage;
        battery.mah_drawn = mah_drawn;
        battery.rssi = rssi;
        battery.amperage = amperage;
        battery.max_amperage = battery.max_amperage.max(amperage);
        Ok(Category::Battery | Category::Rssi)
    }

    fn sensor_status(&self, p: &[u8]) -> Dispatched {
        require(p, 9)?;
        let mut nav = self.state.navigation.write();
        let health = &mut nav.sensors;
        health.hardware_healthy = p[0] != 0;
        health.gyro = p[1];
        health.accelerometer = p[2];
        health.magnetometer = p[3];
        health.barometer = p[4];
        health.gps = p[5];
        health.rangefinder = p[6];
        health.pitot = p[7];
        health.optical_flow = p[8];
        Ok(Category::SensorStatus.into())
    }

    fn sik_radio(&self, p: &[u8]) -> Dispatched {
        require(p, 9)?;
        let mut r = PayloadReader::new(p);
        let rx_errors = r.u16()?;
        let fixed_errors = r.u16()?;

        let mut radio = self.state.radio.write();
        radio.rx_errors = rx_errors;
        radio.fixed_errors = fixed_errors;
        radio.rssi = p[4];
        radio.remote_rssi = p[5];
        radio.tx_buffer = p[6];
        radio.noise = p[7];
        radio.remote_noise = p[8];
        Ok(Category::Rssi.into())
    }

    // =========================================================================
    // Outputs and receiver
    // =========================================================================

    fn outputs(p: &[u8]) -> Result<Vec<u16>, DispatchError> {
        require(p, OUTPUT_SLOTS * 2)?;
        let mut r = PayloadReader::new(p);
        (0..OUTPUT_SLOTS).map(|_| r.u16()).collect()
    }

    fn motor(&self, p: &[u8]) -> Dispatched {
        let motors = Self::outputs(p)?;
        let active = motors.iter().filter(|&&v| v > 0).count();
        let mut record = self.state.motors.write();
        record.motors = motors;
        record.active_motors = active;
        Ok(Category::Motors.into())
    }

    fn servo(&self, p: &[u8]) -> Dispatched {
        let servos = Self::outputs(p)?;
        self.state.motors.write().servos = servos;
        Ok(Category::Motors.into())
    }

    fn rc(&self, p: &[u8]) -> Dispatched {
        let count = (p.len() / 2).min(MAX_RC_CHANNELS);
        if p.len() / 2 > MAX_RC_CHANNELS {
            debug!("MSP_RC carries {} channels, keeping {}", p.len() / 2, MAX_RC_CHANNELS);
        }
        let mut r = PayloadReader::new(p);
        let channels = (0..count).map(|_| r.u16()).collect::<Result<Vec<_>, _>>()?;
        self.state.receiver.write().channels = channels;
        Ok(Category::Receiver.into())
    }

    // =========================================================================
    // GPS and navigation
    // =========================================================================

    fn raw_gps(&self, p: &[u8]) -> Dispatched {
        require(p, 16)?;
        let mut r = PayloadReader::new(p);
        let sample = GpsFix {
            fix: r.bool()?,
            num_sats: r.u8()?,
            latitude: r.i32()? as f64 / 10_000_000.0,
            longitude: r.i32()? as f64 / 10_000_000.0,
            altitude: r.u16()?,
            // cm/s to km/h
            speed: r.u16()? as f64 * 0.036,
            // 1/10 degree
            heading: r.u16()? as f64 / 10.0,
        };
        self.state.gps.write().apply_fix(sample);
        Ok(Category::Gps.into())
    }

    fn comp_gps(&self, p: &[u8]) -> Dispatched {
        require(p, 5)?;
        let mut r = PayloadReader::new(p);
        let distance = r.u16()?;
        let direction = r.u16()?;
        let update = r.u8()?;
        self.state
            .gps
            .write()
            .apply_home_vector(distance, direction, update);
        Ok(Category::Gps.into())
    }

    fn gps_sv_info(&self, p: &[u8]) -> Dispatched {
        require(p, 1)?;
        let count = p[0] as usize;
        require(p, count * 4 + 1)?;
        let satellites = p[1..1 + count * 4]
            .chunks_exact(4)
            .map(|c| Satellite {
                channel: c[0],
                svid: c[1],
                quality: c[2],
                cno: c[3],
            })
            .collect();
        self.state.gps.write().satellites = satellites;
        Ok(Category::Gps.into())
    }

    fn waypoint(&self, p: &[u8]) -> Dispatched {
        let is_inav = self.state.identity.read().is_inav();
        require(p, if is_inav { 21 } else { 15 })?;

        let mut r = PayloadReader::new(p);
        let number = r.u8()?;
        let action = if is_inav {
            WaypointAction::from(r.u8()?)
        } else {
            WaypointAction::Waypoint
        };
        let position = GeoPoint::new(
            r.i32()? as f64 / 10_000_000.0,
            r.i32()? as f64 / 10_000_000.0,
        );
        let altitude = r.i32()? as f64 / 100.0;

        if number == HOME_WAYPOINT {
            self.state.navigation.write().home = position.is_set().then_some(position);
            return Ok(Category::Gps | Category::Navigation);
        }

        if (!is_inav && number == POSHOLD_WAYPOINT) || number == INAV_POSHOLD_WAYPOINT {
            let heading = if is_inav { None } else { Some(r.i16()? as f64) };
            let mut nav = self.state.navigation.write();
            nav.position_hold = Some(position);
            // iNav reports the current GPS altitude here, not the hold target
            if let Some(heading) = heading {
                nav.altitude_hold = altitude;
                nav.heading_hold = heading;
            }
            return Ok(Category::Navigation.into());
        }

        if is_inav {
            let waypoint = Waypoint {
                number,
                action,
                position,
                altitude,
                param1: r.i16()?,
                param2: r.i16()?,
                param3: r.i16()?,
                last: r.u8()? != 0,
            };
            self.state.navigation.write().set_waypoint(waypoint);
            return Ok(Category::Navigation.into());
        }

        Ok(CategorySet::EMPTY)
    }

    fn nav_status(&self, p: &[u8]) -> Dispatched {
        require(p, 7)?;
        let heading_hold = PayloadReader::new(&p[5..]).i16()? as f64;
        let mut nav = self.state.navigation.write();
        nav.nav_mode = p[0];
        nav.nav_state = p[1];
        nav.active_waypoint_action = p[2];
        nav.active_waypoint = p[3];
        nav.nav_error = p[4];
        nav.heading_hold = heading_hold;
        if nav.nav_mode != 0 || nav.nav_state != 0 || nav.nav_error != 0 {
            debug!(
                "NAV_STATUS mode {} state {} error {}",
                nav.nav_mode, nav.nav_state, nav.nav_error
            );
        }
        Ok(Category::Navigation.into())
    }

    fn wp_get_info(&self, p: &[u8]) -> Dispatched {
        require(p, 4)?;
        let mut nav = self.state.navigation.write();
        nav.max_waypoints = p[1];
        nav.mission_valid = p[2] != 0;
        nav.waypoint_count = p[3];
        Ok(Category::Navigation.into())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    fn rc_tuning(&self, p: &[u8]) -> Dispatched {
        require(p, 11)?;
        let pct = |b: u8| b as f64 / 100.0;
        let tpa_breakpoint = PayloadReader::new(&p[8..]).u16()?;
        let yaw_rc_rate = p.get(11).map(|&b| pct(b));

        let mut settings = self.state.settings.write();
        let t = &mut settings.rc_tuning;
        t.rc_rate = pct(p[0]);
        t.rc_expo = pct(p[1]);
        t.roll_rate = pct(p[2]);
        t.pitch_rate = pct(p[3]);
        t.yaw_rate = pct(p[4]);
        t.tpa_rate = pct(p[5]);
        t.throttle_mid = pct(p[6]);
        t.throttle_expo = pct(p[7]);
        t.tpa_breakpoint = tpa_breakpoint;
        t.yaw_expo = pct(p[10]);
        if yaw_rc_rate.is_some() {
            t.yaw_rc_rate = yaw_rc_rate;
        }
        Ok(Category::Settings.into())
    }

    fn pid(&self, p: &[u8]) -> Dispatched {
        let pids = p.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
        self.state.settings.write().pids = pids;
        Ok(Category::Settings.into())
    }

    fn arming_config(&self, p: &[u8]) -> Dispatched {
        require(p, 2)?;
        let mut settings = self.state.settings.write();
        settings.auto_disarm_delay = p[0];
        settings.disarm_kill_switch = p[1] != 0;
        Ok(Category::Settings.into())
    }

    fn misc(&self, p: &[u8]) -> Dispatched {
        require(p, 18)?;
        let mut r = PayloadReader::new(p);
        let mid_rc = r.i16()?;
        let min_throttle = r.i16()?;
        let max_throttle = r.i16()?;
        let min_command = r.i16()?;
        let failsafe_throttle = r.i16()?;
        let gps_type = r.u8()?;
        r.skip(1)?; // gps baud rate
        let gps_ubx_sbas = r.u8()?;
        r.skip(1)?; // multiwii current output
        let rssi_channel = r.u8()?;
        r.skip(1)?;
        let mag_declination = r.i16()? as f64 / 10.0;
        let vbat = if p.len() >= 22 {
            Some((r.u8()?, r.u8()?, r.u8()?, r.u8()?))
        } else {
            None
        };

        let mut settings = self.state.settings.write();
        let m = &mut settings.misc;
        m.mid_rc = mid_rc;
        m.min_throttle = min_throttle;
        m.max_throttle = max_throttle;
        m.min_command = min_command;
        m.failsafe_throttle = failsafe_throttle;
        m.gps_type = gps_type;
        m.gps_ubx_sbas = gps_ubx_sbas;
        m.rssi_channel = rssi_channel;
        m.mag_declination = mag_declination;
        if let Some((scale, min, max, warning)) = vbat {
            m.vbat_scale = scale;
            m.vbat_min_cell = min as f64 / 10.0;
            m.vbat_max_cell = max as f64 / 10.0;
            m.vbat_warning_cell = warning as f64 / 10.0;
            return Ok(Category::Settings | Category::Battery);
        }
        Ok(Category::Settings.into())
    }

    fn mode_ranges(&self, p: &[u8]) -> Dispatched {
        let slots = p.len() / 4;
        let ranges = p
            .chunks_exact(4)
            .map(|c| ModeRange::from_steps(c[0], c[1], c[2], c[3]))
            .filter(|r| r.start < r.end)
            .collect();
        let mut settings = self.state.settings.write();
        settings.mode_ranges = ranges;
        settings.mode_range_slots = slots;
        Ok(Category::Settings.into())
    }

    fn failsafe_config(&self, p: &[u8]) -> Dispatched {
        require(p, 8)?;
        let throttle = PayloadReader::new(&p[2..]).i16()?;
        let low_delay = PayloadReader::new(&p[5..]).u16()?;
        let mut settings = self.state.settings.write();
        let f = &mut settings.failsafe;
        f.delay = p[0] as f64 / 10.0;
        f.off_delay = p[1] as f64 / 10.0;
        f.throttle = throttle;
        f.kill_switch = p[4] != 0;
        f.throttle_low_delay = low_delay as f64 / 10.0;
        f.procedure = p[7];
        Ok(Category::Settings.into())
    }

    fn vtx_config(&self, p: &[u8]) -> Dispatched {
        require(p, 3)?;
        let mut settings = self.state.settings.write();
        let vtx = &mut settings.vtx;
        vtx.device_type = p[0];
        vtx.band = p[1];
        vtx.channel = p[2];
        if p.len() >= 5 {
            vtx.power_index = Some(p[3]);
            vtx.pit_mode = Some(p[4] != 0);
        }
        Ok(Category::Settings.into())
    }

    fn board_alignment(&self, p: &[u8]) -> Dispatched {
        require(p, 6)?;
        let mut r = PayloadReader::new(p);
        let alignment = state::BoardAlignment {
            roll: r.i16()?,
            pitch: r.i16()?,
            yaw: r.i16()?,
        };
        self.state.settings.write().board_alignment = alignment;
        Ok(Category::Settings.into())
    }

    fn motor_config(&self, p: &[u8]) -> Dispatched {
        require(p, 6)?;
        let mut r = PayloadReader::new(p);
        let config = state::MotorConfig {
            min_throttle: r.i16()?,
            max_throttle: r.i16()?,
            min_command: r.i16()?,
        };
        self.state.settings.write().motor_config = config;
        Ok(Category::Settings.into())
    }

    fn gps_config(&self, p: &[u8]) -> Dispatched {
        require(p, 4)?;
        let config = state::GpsConfig {
            provider: p[0],
            ubx_sbas: p[1],
            auto_config: p[2] != 0,
            auto_baud: p[3] != 0,
        };
        self.state.settings.write().gps_config = config;
        Ok(Category::Settings.into())
    }

    fn rc_deadband(&self, p: &[u8]) -> Dispatched {
        require(p, 3)?;
        let throttle_3d = if p.len() >= 5 {
            Some(PayloadReader::new(&p[3..]).i16()?)
        } else {
            None
        };
        let mut settings = self.state.settings.write();
        let d = &mut settings.rc_deadband;
        d.deadband = p[0];
        d.yaw_deadband = p[1];
        d.alt_hold_deadband = p[2];
        d.throttle_3d_deadband = throttle_3d;
        Ok(Category::Settings.into())
    }

    fn advanced_config(&self, p: &[u8]) -> Dispatched {
        require(p, 6)?;
        let pwm_rate = PayloadReader::new(&p[4..]).u16()?;
        let tail = if p.len() >= 8 {
            Some(PayloadReader::new(&p[6..]).u16()?)
        } else {
            None
        };
        let last = p.get(8).map(|&b| b != 0);
        let is_inav = self.state.identity.read().is_inav();

        let mut settings = self.state.settings.write();
        let a = &mut settings.advanced;
        a.gyro_sync_denom = p[0];
        a.pid_process_denom = p[1];
        a.unsynced_pwm = p[2] != 0;
        a.pwm_protocol = p[3];
        a.pwm_rate = pwm_rate;
        if is_inav {
            a.servo_pwm_rate = tail;
            a.sync_loop_with_gyro = last;
            a.digital_idle_offset = None;
            a.gyro_uses_32khz = None;
        } else {
            a.digital_idle_offset = tail.map(|v| v as f64 / 100.0);
            a.gyro_uses_32khz = last;
            a.servo_pwm_rate = None;
            a.sync_loop_with_gyro = None;
        }
        Ok(Category::Settings.into())
    }

    fn filter_config(&self, p: &[u8]) -> Dispatched {
        require(p, 13)?;
        let mut r = PayloadReader::new(&p[1..]);
        let dterm_lpf = r.u16()?;
        let yaw_lpf = r.u16()?;
        let gyro_notch_hz = r.u16()?;
        let gyro_notch_cutoff = r.u16()?;
        let dterm_notch_hz = r.u16()?;
        let dterm_notch_cutoff = r.u16()?;
        let gyro_notch_hz2 = if p.len() >= 15 { Some(r.u16()?) } else { None };
        let gyro_notch_cutoff2 = if p.len() >= 17 { Some(r.u16()?) } else { None };

        let mut settings = self.state.settings.write();
        settings.filters = state::FilterConfig {
            gyro_lpf: p[0],
            dterm_lpf,
            yaw_lpf,
            gyro_notch_hz,
            gyro_notch_cutoff,
            dterm_notch_hz,
            dterm_notch_cutoff,
            gyro_notch_hz2,
            gyro_notch_cutoff2,
            dterm_filter_type: p.get(17).copied(),
        };
        Ok(Category::Settings.into())
    }

    fn rx_config(&self, p: &[u8]) -> Dispatched {
        require(p, 8)?;
        let mut r = PayloadReader::new(&p[1..]);
        let max_check = r.u16()?;
        let mid_rc = r.u16()?;
        let min_check = r.u16()?;
        let mut config = state::RxConfig {
            serial_rx_type: p[0],
            max_check,
            mid_rc,
            min_check,
            spektrum_sat_bind: p[7],
            ..Default::default()
        };
        if p.len() >= 12 {
            let mut r = PayloadReader::new(&p[8..]);
            config.rx_min_usec = Some(r.u16()?);
            config.rx_max_usec = Some(r.u16()?);
        }
        if p.len() >= 14 {
            config.rc_interpolation = Some(p[12]);
            config.rc_interpolation_interval = Some(p[13]);
        }
        if p.len() >= 16 {
            config.airmode_activate_threshold = Some(PayloadReader::new(&p[14..]).u16()?);
        }
        if p.len() >= 22 {
            config.spi_protocol = Some(p[16]);
            config.spi_id = Some(PayloadReader::new(&p[17..]).u32()?);
            config.spi_channel_count = Some(p[21]);
        }
        config.fpv_cam_angle = p.get(22).copied();

        self.state.settings.write().rx_config = config;
        Ok(Category::Settings.into())
    }

    fn rx_fail_config(&self, p: &[u8]) -> Dispatched {
        if p.len() % 3 != 0 {
            return Err(DispatchError::Malformed {
                reason: "rxfail entries are 3 bytes",
            });
        }
        let channels = p
            .chunks_exact(3)
            .map(|c| state::RxFailChannel {
                mode: c[0],
                value: u16::from_le_bytes([c[1], c[2]]),
            })
            .collect();
        self.state.settings.write().rx_fail = channels;
        Ok(Category::Settings.into())
    }

    fn serial_config(&self, p: &[u8]) -> Dispatched {
        require(p, 7)?;
        let ports = p
            .chunks_exact(7)
            .map(|c| state::SerialPort {
                id: c[0],
                functions: u16::from_le_bytes([c[1], c[2]]),
                msp_baud: c[3],
                gps_baud: c[4],
                telemetry_baud: c[5],
                blackbox_baud: c[6],
            })
            .collect();
        self.state.settings.write().serial_ports = ports;
        Ok(Category::Settings.into())
    }

    fn servo_configurations(&self, p: &[u8]) -> Dispatched {
        require(p, 14)?;
        let mut servos = Vec::with_capacity(p.len() / 14);
        for c in p.chunks_exact(14) {
            let mut r = PayloadReader::new(c);
            let min = r.i16()?;
            let max = r.i16()?;
            let middle = r.i16()?;
            let rate = r.i8()?;
            let min_angle = r.u8()?;
            let max_angle = r.u8()?;
            let channel = r.u8()?;
            let reversed_sources = r.u32()?;
            servos.push(state::ServoConfig {
                min,
                max,
                middle,
                rate,
                min_angle,
                max_angle,
                forward_channel: (channel != SERVO_FORWARD_DISABLED).then_some(channel),
                reversed_sources,
            });
        }
        self.state.settings.write().servo_configs = servos;
        Ok(Category::Settings.into())
    }

    fn osd_config(&self, p: &[u8]) -> Dispatched {
        require(p, 1)?;
        let supported = p[0] & 1 != 0;
        let mut osd = state::Osd {
            supported,
            ..Default::default()
        };
        if supported {
            require(p, 2)?;
            osd.video_mode = p[1];
            if p.len() >= 10 {
                let mut r = PayloadReader::new(&p[4..]);
                osd.unit_mode = Some(p[2]);
                osd.rssi_alarm = Some(p[3]);
                osd.capacity_alarm = Some(r.i16()?);
                osd.minutes_alarm = Some(r.i16()?);
                osd.altitude_alarm = Some(r.i16()?);
            }
        }
        self.state.settings.write().osd = osd;
        Ok(Category::Settings.into())
    }

    // =========================================================================
    // Power
    // =========================================================================

    fn battery_config(&self, p: &[u8]) -> Dispatched {
        require(p, 7)?;
        let capacity = PayloadReader::new(&p[3..]).u16()?;
        let mut settings = self.state.settings.write();
        settings.battery = state::BatteryConfig {
            min_cell_voltage: p[0] as f64 / 10.0,
            max_cell_voltage: p[1] as f64 / 10.0,
            warning_cell_voltage: p[2] as f64 / 10.0,
            capacity,
            voltage_meter_source: p[5],
            current_meter_source: p[6],
        };
        Ok(Category::Settings | Category::Battery)
    }

    /// Three layouts: 3 bytes (scale and divider), 7 or more (Betaflight,
    /// with a meter id) and anything in between (legacy, with cell limits)
    fn voltage_meter_config(&self, p: &[u8]) -> Dispatched {
        require(p, 3)?;
        let mut settings = self.state.settings.write();
        match p.len() {
            3 => {
                settings.voltage_meter = state::VoltageMeter {
                    scale: p[0],
                    divider_value: p[1],
                    divider_multiplier: p[2],
                    ..Default::default()
                };
                Ok(Category::Settings.into())
            }
            len if len >= 7 => {
                settings.voltage_meter = state::VoltageMeter {
                    id: Some(p[2]),
                    scale: p[4],
                    divider_value: p[5],
                    divider_multiplier: p[6],
                    meter_type: None,
                };
                Ok(Category::Settings.into())
            }
            _ => {
                settings.voltage_meter.scale = p[0];
                settings.voltage_meter.meter_type = p.get(4).copied();
                let battery = &mut settings.battery;
                battery.min_cell_voltage = p[1] as f64 / 10.0;
                battery.max_cell_voltage = p[2] as f64 / 10.0;
                battery.warning_cell_voltage = p[3] as f64 / 10.0;
                Ok(Category::Settings | Category::Battery)
            }
        }
    }

    fn current_meter_config(&self, p: &[u8]) -> Dispatched {
        require(p, 7)?;
        let meter = if p.len() == 7 {
            let scale = PayloadReader::new(p).i16()?;
            let offset = PayloadReader::new(&p[2..]).i16()?;
            let capacity = PayloadReader::new(&p[5..]).i16()?;
            state::CurrentMeter {
                id: None,
                meter_type: p[4],
                scale,
                offset,
                capacity: Some(capacity),
            }
        } else {
            let mut r = PayloadReader::new(&p[4..]);
            state::CurrentMeter {
                id: Some(p[2]),
                meter_type: p[3],
                scale: r.i16()?,
                offset: r.i16()?,
                capacity: None,
            }
        };
        self.state.settings.write().current_meter = meter;
        Ok(Category::Settings.into())
    }

    // =========================================================================
    // iNav navigation config
    // =========================================================================

    fn nav_poshold(&self, p: &[u8]) -> Dispatched {
        require(p, 13)?;
        let mut r = PayloadReader::new(&p[1..]);
        let max_speed = r.u16()? as f64 / 100.0;
        let max_climb_rate = r.u16()? as f64 / 100.0;
        let max_manual_speed = r.u16()? as f64 / 100.0;
        let max_manual_climb_rate = r.u16()? as f64 / 100.0;
        let hover_throttle = PayloadReader::new(&p[11..]).u16()?;
        self.state.settings.write().position_hold = state::PositionHold {
            user_control_mode: p[0],
            max_speed,
            max_climb_rate,
            max_manual_speed,
            max_manual_climb_rate,
            max_bank_angle: p[9],
            use_throttle_mid_for_alt_hold: p[10] != 0,
            hover_throttle,
        };
        Ok(Category::Settings.into())
    }

    fn rth_and_land_config(&self, p: &[u8]) -> Dispatched {
        require(p, 19)?;
        let min_distance = PayloadReader::new(p).u16()? as f64 / 100.0;
        let mut r = PayloadReader::new(&p[7..]);
        let abort_threshold = r.u16()? as f64 / 100.0;
        let altitude = r.u16()? as f64 / 100.0;
        let land_descend_rate = r.u16()? as f64 / 100.0;
        let land_slowdown_min_alt = r.u16()? as f64 / 100.0;
        let land_slowdown_max_alt = r.u16()? as f64 / 100.0;
        let emergency_descend_rate = r.u16()? as f64 / 100.0;
        self.state.settings.write().return_to_home = state::ReturnToHome {
            min_distance,
            climb_first: p[2] != 0,
            climb_ignore_emergency: p[3] != 0,
            tail_first: p[4] != 0,
            allow_landing: p[5] != 0,
            alt_control_mode: p[6],
            abort_threshold,
            altitude,
            land_descend_rate,
            land_slowdown_min_alt,
            land_slowdown_max_alt,
            emergency_descend_rate,
        };
        Ok(Category::Settings.into())
    }

    fn fw_config(&self, p: &[u8]) -> Dispatched {
        require(p, 12)?;
        let mut r = PayloadReader::new(p);
        let cruise_throttle = r.u16()?;
        let min_throttle = r.u16()?;
        let max_throttle = r.u16()?;
        let loiter_radius = PayloadReader::new(&p[10..]).u16()? as f64 / 100.0;
        self.state.settings.write().fixed_wing = state::FixedWing {
            cruise_throttle,
            min_throttle,
            max_throttle,
            max_bank_angle: p[6],
            max_climb_angle: p[7],
            max_dive_angle: p[8],
            pitch_to_throttle: p[9],
            loiter_radius,
        };
        Ok(Category::Settings.into())
    }

    // =========================================================================
    // Storage
    // =========================================================================

    fn dataflash_summary(&self, p: &[u8]) -> Dispatched {
        require(p, 13)?;
        let mut r = PayloadReader::new(&p[1..]);
        let sectors = r.u32()?;
        let total = r.u32()?;
        let used = r.u32()?;
        let mut storage = self.state.storage.write();
        storage.dataflash_ready = p[0] & 1 != 0;
        storage.dataflash_sectors = sectors;
        storage.dataflash_total_size = total;
        storage.dataflash_used_size = used;
        Ok(Category::Storage.into())
    }

    fn sdcard_summary(&self, p: &[u8]) -> Dispatched {
        require(p, 11)?;
        let mut r = PayloadReader::new(&p[3..]);
        let free_kb = r.u32()?;
        let total_kb = r.u32()?;
        let mut storage = self.state.storage.write();
        storage.sdcard_supported = p[0] != 0;
        storage.sdcard_state = p[1];
        storage.sdcard_last_error = p[2];
        storage.sdcard_free_space = free_kb as u64 * 1024;
        storage.sdcard_total_space = total_kb as u64 * 1024;
        Ok(Category::Storage.into())
    }

    fn blackbox_config(&self, p: &[u8]) -> Dispatched {
        require(p, 4)?;
        let mut storage = self.state.storage.write();
        storage.blackbox_supported = p[0] != 0;
        storage.blackbox_device = p[1];
        storage.blackbox_rate_num = p[2];
        storage.blackbox_rate_denom = p[3];
        Ok(Category::Storage.into())
    }
}

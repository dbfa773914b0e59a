#![no_std]
//! MPU-9250 9-axis IMU (with its AK8963 magnetometer) on top of the
//! callback-driven `i2c-async` engine.
//!
//! Every bus operation takes the driver by value and hands it back to the
//! completion callback together with the result, so exactly one operation
//! chain owns the device at a time.

extern crate alloc;

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod calibration;
pub mod config;
pub mod ll;
pub mod madgwick;
pub mod sim;

use alloc::vec::Vec;
use core::f32::consts::PI;

use i2c_async::{
    Bus, Clock, Duration, Instant, RegisterWrite, SequenceReport, StatusCode, Transport,
    MAX_TRANSFER_LEN,
};

pub use calibration::{MagCalibration, MotionBias, ACCEL_GYRO_CAL_SAMPLES, MAG_CAL_SAMPLES};
pub use config::Mpu9250Config;
pub use ll::{AccelScale, GyroScale, MagMode, MagScale, Status1, Status2};
pub use madgwick::MadgwickFilter;
pub use micromath::vector::F32x3;
pub use micromath::Quaternion;

use ll::{ak, mpu, AK8963_ADDRESS, MPU9250_ADDRESS, MPU9250_ID};

/// m/s^2 per g.
pub const STANDARD_GRAVITY: f32 = 9.80665;
const DEG_TO_RAD: f32 = PI / 180.0;

const SETTLE: Duration = Duration::from_millis(100);
const MAG_SETTLE: Duration = Duration::from_millis(10);

#[derive(derive_more::From, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The request was rejected before reaching the bus.
    #[from]
    Bus(i2c_async::Error),
    /// The transfer completed with a failure status.
    #[from]
    Transfer(StatusCode),
    /// WHO_AM_I returned something other than the MPU-9250 id.
    InvalidWhoAmI(u8),
    /// The magnetometer reported a saturated measurement.
    MagnetometerOverflow,
    /// Sampling was requested before [`Mpu9250::init_all`] finished.
    NotInitialized,
    /// A calibration run ended without a usable sample.
    NoCalibrationData,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Bus(err) => write!(f, "request rejected: {}", err),
            Error::Transfer(status) => write!(f, "transfer failed: {}", status),
            Error::InvalidWhoAmI(id) => {
                write!(f, "unexpected WHO_AM_I {:#04x} (expected {:#04x})", id, MPU9250_ID)
            }
            Error::MagnetometerOverflow => write!(f, "magnetometer overflow"),
            Error::NotInitialized => write!(f, "device not initialized"),
            Error::NoCalibrationData => write!(f, "no usable calibration samples"),
        }
    }
}

impl core::error::Error for Error {}

/// Raw accelerometer, temperature and gyroscope registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawMotion {
    pub accel: [i16; 3],
    pub temp: i16,
    pub gyro: [i16; 3],
}

/// Decode ACCEL_XOUT_H..GYRO_ZOUT_L (big-endian).
pub fn decode_accel_gyro(bytes: &[u8; mpu::ACCEL_GYRO_LEN]) -> RawMotion {
    let word = |i: usize| i16::from_be_bytes([bytes[i], bytes[i + 1]]);
    RawMotion {
        accel: [word(0), word(2), word(4)],
        temp: word(6),
        gyro: [word(8), word(10), word(12)],
    }
}

/// Decode HXL..HZH plus ST2 (little-endian data).
pub fn decode_mag(bytes: &[u8; ak::MAG_LEN]) -> ([i16; 3], Status2) {
    let word = |i: usize| i16::from_le_bytes([bytes[i], bytes[i + 1]]);
    ([word(0), word(2), word(4)], Status2::from_bits_retain(bytes[6]))
}

/// Degrees Celsius from TEMP_OUT.
pub fn temperature_celsius(raw: i16) -> f32 {
    f32::from(raw) / 333.87 + 21.0
}

/// Scaled accelerometer and gyroscope reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    /// m/s^2
    pub accel: F32x3,
    /// rad/s
    pub gyro: F32x3,
}

pub struct Mpu9250 {
    config: Mpu9250Config,
    initialized: bool,
    /// AK8963 factory sensitivity adjustment per axis.
    mag_adjust: [f32; 3],
    accel: F32x3,
    gyro: F32x3,
    mag: F32x3,
    filter: MadgwickFilter,
    last_update: Option<Instant>,
}

fn zero() -> F32x3 {
    F32x3 { x: 0.0, y: 0.0, z: 0.0 }
}

impl Default for Mpu9250 {
    fn default() -> Self {
        Self::new(Mpu9250Config::default())
    }
}

impl Mpu9250 {
    pub fn new(config: Mpu9250Config) -> Self {
        Self {
            config,
            initialized: false,
            mag_adjust: [1.0; 3],
            accel: zero(),
            gyro: zero(),
            mag: zero(),
            filter: MadgwickFilter::new(config.beta),
            last_update: None,
        }
    }

    pub fn config(&self) -> &Mpu9250Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Set the hard-iron offset (mG, +North, +East, +Down).
    pub fn set_mag_bias(&mut self, north: f32, east: f32, down: f32) {
        self.config.set_mag_bias(north, east, down);
    }

    pub fn mag_adjustment(&self) -> [f32; 3] {
        self.mag_adjust
    }

    /// Last accelerometer reading, m/s^2.
    pub fn accel(&self) -> F32x3 {
        self.accel
    }

    /// Last gyroscope reading, rad/s.
    pub fn gyro(&self) -> F32x3 {
        self.gyro
    }

    /// Last magnetometer reading, mG.
    pub fn mag(&self) -> F32x3 {
        self.mag
    }

    pub fn quaternion(&self) -> Quaternion {
        self.filter.quaternion()
    }

    /// Fuse the latest readings into the orientation estimate (NED frame).
    ///
    /// The integration interval is the time since the previous update; the
    /// first update only records `now`.
    pub fn update_orientation(&mut self, now: Instant) -> Quaternion {
        let dt = self
            .last_update
            .and_then(|last| now.checked_duration_since(last))
            .map_or(0.0, |elapsed| elapsed.as_micros() as f32 / 1_000_000.0);
        self.last_update = Some(now);

        // Accel/gyro x and y are swapped relative to the magnetometer and z
        // points up instead of down. Gravity is positive down.
        let (a, g, m) = (self.accel, self.gyro, self.mag);
        self.filter.update(
            F32x3 { x: -a.y, y: -a.x, z: a.z },
            F32x3 { x: g.y, y: g.x, z: -g.z },
            F32x3 { x: m.x, y: m.y, z: m.z },
            dt,
        )
    }

    /// Read WHO_AM_I.
    pub fn who_am_i<T, C, F>(self, bus: &mut Bus<T, C>, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<u8, Error>) + 'static,
    {
        let issued = bus.read_single(
            MPU9250_ADDRESS,
            mpu::WHO_AM_I,
            Duration::from_ticks(0),
            move |bus, status, byte| {
                let result = match (status, byte) {
                    (StatusCode::Ok, Some(id)) => Ok(id),
                    (status, _) => Err(Error::Transfer(status)),
                };
                callback(bus, self, result)
            },
        );
        if let Err(err) = issued {
            error!("mpu9250: WHO_AM_I not issued: {:?}", err);
        }
    }

    /// Read the AK8963 WIA register. Only reachable after `init_all` has
    /// enabled the I2C bypass.
    pub fn mag_who_am_i<T, C, F>(self, bus: &mut Bus<T, C>, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<u8, Error>) + 'static,
    {
        self.read(bus, AK8963_ADDRESS, ak::WIA, 1, move |bus, this, result| {
            let result = result.and_then(|bytes| first(&bytes));
            callback(bus, this, result)
        });
    }

    /// Check that an MPU-9250 answers at its address.
    pub fn probe<T, C, F>(self, bus: &mut Bus<T, C>, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<(), Error>) + 'static,
    {
        self.who_am_i(bus, move |bus, this, result| {
            let result = match result {
                Ok(MPU9250_ID) => Ok(()),
                Ok(id) => Err(Error::InvalidWhoAmI(id)),
                Err(err) => Err(err),
            };
            callback(bus, this, result)
        });
    }

    /// Reset and configure the MPU-9250, then the AK8963. Does nothing if
    /// the device is already initialized.
    pub fn init_all<T, C, F>(self, bus: &mut Bus<T, C>, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<(), Error>) + 'static,
    {
        if self.initialized {
            bus.post(move |bus| callback(bus, self, Ok(())));
            return;
        }

        let steps = self.mpu_init_steps();
        bus.write_sequence(MPU9250_ADDRESS, steps, move |bus, report| {
            match sequence_result(report) {
                Ok(()) => self.init_ak8963(bus, callback),
                Err(err) => callback(bus, self, Err(err)),
            }
        });
    }

    fn mpu_init_steps(&self) -> [RegisterWrite; 10] {
        [
            RegisterWrite::new(mpu::PWR_MGMT_1, mpu::H_RESET).with_delay(SETTLE),
            // Wake; the PLL needs time to lock on the gyro.
            RegisterWrite::new(mpu::PWR_MGMT_1, 0x00).with_delay(SETTLE),
            RegisterWrite::new(mpu::PWR_MGMT_1, mpu::CLKSEL_PLL),
            RegisterWrite::new(mpu::CONFIG, mpu::DLPF_41HZ),
            RegisterWrite::new(mpu::SMPLRT_DIV, mpu::RATE_200HZ),
            RegisterWrite::new(mpu::GYRO_CONFIG, self.config.gyro_scale.bits()),
            RegisterWrite::new(mpu::ACCEL_CONFIG, self.config.accel_scale.bits()),
            RegisterWrite::new(mpu::ACCEL_CONFIG2, mpu::A_DLPF_41HZ),
            RegisterWrite::new(mpu::INT_PIN_CFG, mpu::LATCH_BYPASS),
            RegisterWrite::new(mpu::INT_ENABLE, mpu::RAW_RDY_EN).with_delay(SETTLE),
        ]
    }

    fn init_ak8963<T, C, F>(self, bus: &mut Bus<T, C>, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<(), Error>) + 'static,
    {
        let fuse_rom = [
            RegisterWrite::new(ak::CNTL, ak::POWER_DOWN).with_delay(MAG_SETTLE),
            RegisterWrite::new(ak::CNTL, ak::FUSE_ROM).with_delay(MAG_SETTLE),
        ];
        bus.write_sequence(AK8963_ADDRESS, fuse_rom, move |bus, report| {
            if let Err(err) = sequence_result(report) {
                return callback(bus, self, Err(err));
            }
            self.read(bus, AK8963_ADDRESS, ak::ASAX, 3, move |bus, mut this, result| {
                let asa = match result {
                    Ok(asa) => asa,
                    Err(err) => return callback(bus, this, Err(err)),
                };
                for (adjust, raw) in this.mag_adjust.iter_mut().zip(asa) {
                    *adjust = (f32::from(raw) - 128.0) / 256.0 + 1.0;
                }
                debug!(
                    "ak8963: sensitivity adjustment {} {} {}",
                    this.mag_adjust[0], this.mag_adjust[1], this.mag_adjust[2]
                );

                let control = ll::mag_control(this.config.mag_scale, this.config.mag_mode);
                let measure = [
                    RegisterWrite::new(ak::CNTL, ak::POWER_DOWN).with_delay(MAG_SETTLE),
                    RegisterWrite::new(ak::CNTL, control).with_delay(MAG_SETTLE),
                ];
                bus.write_sequence(AK8963_ADDRESS, measure, move |bus, report| {
                    let result = sequence_result(report);
                    if result.is_ok() {
                        this.initialized = true;
                        info!("mpu9250: initialized");
                    }
                    callback(bus, this, result)
                });
            });
        });
    }

    /// Read and scale accelerometer and gyroscope.
    pub fn read_accel_gyro<T, C, F>(self, bus: &mut Bus<T, C>, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<MotionSample, Error>) + 'static,
    {
        if !self.initialized {
            return self.fail_later(bus, Error::NotInitialized, callback);
        }
        let len = mpu::ACCEL_GYRO_LEN;
        self.read(bus, MPU9250_ADDRESS, mpu::ACCEL_XOUT_H, len, move |bus, mut this, result| {
            let result = result
                .and_then(|bytes| exact::<{ mpu::ACCEL_GYRO_LEN }>(&bytes))
                .map(|bytes| this.apply_motion(decode_accel_gyro(&bytes)));
            callback(bus, this, result)
        });
    }

    fn apply_motion(&mut self, raw: RawMotion) -> MotionSample {
        let a_res = self.config.accel_scale.resolution();
        let g_res = self.config.gyro_scale.resolution();
        let accel = |i: usize| {
            (f32::from(raw.accel[i]) * a_res - self.config.accel_bias[i]) * STANDARD_GRAVITY
        };
        let gyro =
            |i: usize| (f32::from(raw.gyro[i]) * g_res - self.config.gyro_bias[i]) * DEG_TO_RAD;

        let sample = MotionSample {
            accel: F32x3 { x: accel(0), y: accel(1), z: accel(2) },
            gyro: F32x3 { x: gyro(0), y: gyro(1), z: gyro(2) },
        };
        self.accel = sample.accel;
        self.gyro = sample.gyro;
        sample
    }

    /// Read the magnetometer in mG. When the measurement mode requires it,
    /// ST1 is checked first; without new data the previous reading is
    /// returned unchanged.
    pub fn read_mag<T, C, F>(self, bus: &mut Bus<T, C>, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<F32x3, Error>) + 'static,
    {
        if !self.initialized {
            return self.fail_later(bus, Error::NotInitialized, callback);
        }
        if !self.config.mag_mode.polls_data_ready() {
            return self.read_mag_data(bus, callback);
        }

        self.read(bus, AK8963_ADDRESS, ak::ST1, 1, move |bus, this, result| {
            match result.and_then(|bytes| first(&bytes)) {
                Ok(st1) if Status1::from_bits_retain(st1).contains(Status1::DRDY) => {
                    this.read_mag_data(bus, callback)
                }
                Ok(_) => {
                    trace!("ak8963: no new data");
                    let mag = this.mag;
                    callback(bus, this, Ok(mag))
                }
                Err(err) => callback(bus, this, Err(err)),
            }
        });
    }

    fn read_mag_data<T, C, F>(self, bus: &mut Bus<T, C>, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<F32x3, Error>) + 'static,
    {
        self.read(bus, AK8963_ADDRESS, ak::XOUT_L, ak::MAG_LEN, move |bus, mut this, result| {
            let result = result
                .and_then(|bytes| exact::<{ ak::MAG_LEN }>(&bytes))
                .and_then(|bytes| this.apply_mag(&bytes));
            callback(bus, this, result)
        });
    }

    fn apply_mag(&mut self, bytes: &[u8; ak::MAG_LEN]) -> Result<F32x3, Error> {
        let (raw, st2) = decode_mag(bytes);
        if st2.contains(Status2::HOFL) {
            warn!("ak8963: magnetic sensor overflow");
            return Err(Error::MagnetometerOverflow);
        }

        let res = self.config.mag_scale.resolution();
        let axis = |i: usize| {
            (f32::from(raw[i]) * res * self.mag_adjust[i] - self.config.mag_bias[i])
                * self.config.mag_scale_factors[i]
        };
        self.mag = F32x3 { x: axis(0), y: axis(1), z: axis(2) };
        Ok(self.mag)
    }

    /// Read the die temperature in degrees Celsius.
    pub fn read_temperature<T, C, F>(self, bus: &mut Bus<T, C>, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<f32, Error>) + 'static,
    {
        if !self.initialized {
            return self.fail_later(bus, Error::NotInitialized, callback);
        }
        self.read(bus, MPU9250_ADDRESS, mpu::TEMP_OUT_H, 2, move |bus, this, result| {
            let result = result
                .and_then(|bytes| exact::<2>(&bytes))
                .map(|bytes| temperature_celsius(i16::from_be_bytes(bytes)));
            callback(bus, this, result)
        });
    }

    /// `read_multiple` that moves the driver through to `callback`.
    fn read<T, C, F>(self, bus: &mut Bus<T, C>, address: u8, register: u8, len: usize, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<Vec<u8>, Error>) + 'static,
    {
        // Checked up front: a rejected request would drop the driver with
        // the callback.
        if len == 0 || len > MAX_TRANSFER_LEN {
            return self.fail_later(bus, i2c_async::Error::InvalidLength(len).into(), callback);
        }

        let issued = bus.read_multiple(
            address,
            register,
            len,
            Duration::from_ticks(0),
            move |bus, status, _, data| {
                let result = match (status, data) {
                    (StatusCode::Ok, Some(bytes)) => Ok(bytes),
                    (status, _) => Err(Error::Transfer(status)),
                };
                callback(bus, self, result)
            },
        );
        if let Err(err) = issued {
            error!("mpu9250: read of {:#x} not issued: {:?}", register, err);
        }
    }

    fn fail_later<T, C, R, F>(self, bus: &mut Bus<T, C>, error: Error, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        R: 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<R, Error>) + 'static,
    {
        bus.post(move |bus| callback(bus, self, Err(error)));
    }
}

fn sequence_result(report: SequenceReport) -> Result<(), Error> {
    if report.is_ok() {
        return Ok(());
    }
    if let Some(step) = report.failed {
        warn!(
            "mpu9250: write of {:#x} to register {:#x} failed: {:?}",
            step.value, step.register, report.status
        );
    }
    Err(Error::Transfer(report.status))
}

fn first(bytes: &[u8]) -> Result<u8, Error> {
    bytes.first().copied().ok_or(Error::Transfer(StatusCode::Error))
}

fn exact<const N: usize>(bytes: &[u8]) -> Result<[u8; N], Error> {
    bytes.try_into().map_err(|_| Error::Transfer(StatusCode::Error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accel_gyro_is_big_endian() {
        let bytes = [
            0x40, 0x00, 0xFF, 0xFE, 0x00, 0x01, // accel
            0x01, 0x00, // temp
            0x00, 0x83, 0x80, 0x00, 0x7F, 0xFF, // gyro
        ];
        let raw = decode_accel_gyro(&bytes);
        assert_eq!(raw.accel, [16384, -2, 1]);
        assert_eq!(raw.temp, 256);
        assert_eq!(raw.gyro, [131, i16::MIN, i16::MAX]);
    }

    #[test]
    fn mag_is_little_endian_with_status() {
        let (raw, st2) = decode_mag(&[0x10, 0x00, 0xF0, 0xFF, 0x00, 0x80, 0x18]);
        assert_eq!(raw, [16, -16, i16::MIN]);
        assert!(st2.contains(Status2::HOFL));
    }

    #[test]
    fn scaling_follows_configured_range() {
        let mut imu = Mpu9250::default();
        let sample = imu.apply_motion(RawMotion {
            accel: [0, 0, 16384],
            temp: 0,
            gyro: [131, 0, 0],
        });
        assert!((sample.accel.z - STANDARD_GRAVITY).abs() < 1e-3);
        // 131 LSB is 1 deg/s at 250 dps full scale.
        assert!((sample.gyro.x - DEG_TO_RAD).abs() < 1e-4);
        assert_eq!(imu.accel(), sample.accel);
    }

    #[test]
    fn mag_applies_adjustment_bias_and_scale() {
        let mut config = Mpu9250Config::default();
        config.set_mag_bias(1.0, 0.0, 0.0);
        config.mag_scale_factors = [2.0, 1.0, 1.0];
        let mut imu = Mpu9250::new(config);

        let res = MagScale::Bits16.resolution();
        let mag = imu.apply_mag(&[100, 0, 0, 0, 0, 0, 0x10]).unwrap();
        assert!((mag.x - (100.0 * res - 1.0) * 2.0).abs() < 1e-4);
        assert_eq!(mag.y, 0.0);
    }

    #[test]
    fn temperature_offset() {
        assert!((temperature_celsius(0) - 21.0).abs() < 1e-6);
    }

    #[test]
    fn first_orientation_update_does_not_integrate() {
        let mut imu = Mpu9250::default();
        imu.gyro = F32x3 { x: 0.0, y: 0.0, z: 10.0 };
        let q = imu.update_orientation(Instant::from_millis(500));
        assert_eq!(q.w(), 1.0);
    }
}

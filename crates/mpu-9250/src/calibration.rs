//! At-rest accelerometer/gyroscope offsets and magnetometer hard-iron and
//! soft-iron correction.
//!
//! Both routines are chains of delayed reads on the bus. The results are
//! written into the driver's [`Mpu9250Config`](crate::Mpu9250Config) and
//! applied to every later sample.

use i2c_async::{Bus, Clock, Duration, StatusCode, Transport};

use crate::ll::{
    self, ak, mpu, AccelScale, GyroScale, MagMode, Status2, AK8963_ADDRESS, MPU9250_ADDRESS,
};
use crate::{decode_accel_gyro, decode_mag, exact, Error, Mpu9250, RawMotion, MAG_SETTLE};

/// Readings averaged by a typical accelerometer/gyroscope calibration.
pub const ACCEL_GYRO_CAL_SAMPLES: usize = 40;
/// Readings taken by a typical magnetometer sweep.
pub const MAG_CAL_SAMPLES: usize = 128;

/// One sample period at the 200 Hz rate `init_all` configures.
const MOTION_INTERVAL: Duration = Duration::from_millis(5);

/// Wait between magnetometer samples so each one is a fresh measurement.
fn mag_interval(mode: MagMode) -> Duration {
    match mode {
        MagMode::Continuous8Hz => Duration::from_millis(135),
        MagMode::Continuous100Hz | MagMode::Single => Duration::from_millis(12),
    }
}

/// Offsets measured with the device at rest and z vertical.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MotionBias {
    /// g
    pub accel: [f32; 3],
    /// Degrees per second.
    pub gyro: [f32; 3],
}

/// Magnetometer correction from a min/max sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MagCalibration {
    /// Hard-iron offset, mG.
    pub bias: [f32; 3],
    /// Soft-iron scale factors.
    pub scale: [f32; 3],
}

/// Running sums of raw accelerometer and gyroscope counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionAccumulator {
    accel: [i32; 3],
    gyro: [i32; 3],
    samples: i32,
}

impl MotionAccumulator {
    pub fn record(&mut self, raw: &RawMotion) {
        for i in 0..3 {
            self.accel[i] += i32::from(raw.accel[i]);
            self.gyro[i] += i32::from(raw.gyro[i]);
        }
        self.samples += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples as usize
    }

    /// Average offsets, with one g of gravity taken off the z axis.
    pub fn solve(&self, accel: AccelScale, gyro: GyroScale) -> Option<MotionBias> {
        if self.samples == 0 {
            return None;
        }
        let (a_res, g_res) = (accel.resolution(), gyro.resolution());
        let mut bias = MotionBias {
            accel: self.accel.map(|sum| (sum / self.samples) as f32 * a_res),
            gyro: self.gyro.map(|sum| (sum / self.samples) as f32 * g_res),
        };
        if bias.accel[2] > 0.0 {
            bias.accel[2] -= 1.0;
        } else {
            bias.accel[2] += 1.0;
        }
        Some(bias)
    }
}

/// Per-axis extremes of raw magnetometer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagExtent {
    min: [i16; 3],
    max: [i16; 3],
    samples: usize,
}

impl Default for MagExtent {
    fn default() -> Self {
        Self::new()
    }
}

impl MagExtent {
    pub const fn new() -> Self {
        Self { min: [i16::MAX; 3], max: [i16::MIN; 3], samples: 0 }
    }

    pub fn record(&mut self, raw: [i16; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(raw[i]);
            self.max[i] = self.max[i].max(raw[i]);
        }
        self.samples += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Hard-iron offset is the centre of each axis' range; soft-iron scale
    /// stretches every half-range to their mean. Scales stay at 1.0 when an
    /// axis never moved.
    pub fn solve(&self, resolution: f32, adjust: [f32; 3]) -> Option<MagCalibration> {
        if self.samples == 0 {
            return None;
        }
        let mut bias = [0.0; 3];
        let mut chord = [0i32; 3];
        for i in 0..3 {
            let (lo, hi) = (i32::from(self.min[i]), i32::from(self.max[i]));
            bias[i] = ((hi + lo) / 2) as f32 * resolution * adjust[i];
            chord[i] = (hi - lo) / 2;
        }

        let scale = if chord.contains(&0) {
            [1.0; 3]
        } else {
            let mean = chord.iter().sum::<i32>() as f32 / 3.0;
            chord.map(|c| mean / c as f32)
        };
        Some(MagCalibration { bias, scale })
    }
}

impl Mpu9250 {
    /// Average `samples` accelerometer/gyroscope readings and store them as
    /// the configured offsets. The device has to lie still with z vertical.
    pub fn calibrate_accel_gyro<T, C, F>(self, bus: &mut Bus<T, C>, samples: usize, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<MotionBias, Error>) + 'static,
    {
        if !self.initialized {
            return self.fail_later(bus, Error::NotInitialized, callback);
        }
        debug!("mpu9250: accel/gyro calibration over {} samples", samples);
        self.motion_cal_step(bus, MotionAccumulator::default(), samples, callback);
    }

    fn motion_cal_step<T, C, F>(
        mut self,
        bus: &mut Bus<T, C>,
        mut acc: MotionAccumulator,
        remaining: usize,
        callback: F,
    ) where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<MotionBias, Error>) + 'static,
    {
        if remaining == 0 {
            let result = acc
                .solve(self.config.accel_scale, self.config.gyro_scale)
                .ok_or(Error::NoCalibrationData);
            if let Ok(bias) = result {
                self.config.accel_bias = bias.accel;
                self.config.gyro_bias = bias.gyro;
                info!("mpu9250: accel/gyro offsets from {} samples", acc.samples());
            }
            return callback(bus, self, result);
        }

        let len = mpu::ACCEL_GYRO_LEN;
        self.read(bus, MPU9250_ADDRESS, mpu::ACCEL_XOUT_H, len, move |bus, this, result| {
            match result.and_then(|bytes| exact::<{ mpu::ACCEL_GYRO_LEN }>(&bytes)) {
                Ok(bytes) => acc.record(&decode_accel_gyro(&bytes)),
                Err(err) => return callback(bus, this, Err(err)),
            }
            if remaining == 1 {
                this.motion_cal_step(bus, acc, 0, callback);
            } else {
                bus.post_after(MOTION_INTERVAL, move |bus| {
                    this.motion_cal_step(bus, acc, remaining - 1, callback)
                });
            }
        });
    }

    /// Sample the magnetometer `samples` times while the device is turned
    /// through every orientation, then store hard-iron bias and soft-iron
    /// scale in the config.
    ///
    /// Overflowed samples are skipped. Fails with
    /// [`Error::NoCalibrationData`] if none were usable.
    pub fn calibrate_mag<T, C, F>(self, bus: &mut Bus<T, C>, samples: usize, callback: F)
    where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<MagCalibration, Error>) + 'static,
    {
        if !self.initialized {
            return self.fail_later(bus, Error::NotInitialized, callback);
        }
        debug!("ak8963: calibration over {} samples", samples);
        self.mag_cal_step(bus, MagExtent::new(), samples, callback);
    }

    fn mag_cal_step<T, C, F>(
        mut self,
        bus: &mut Bus<T, C>,
        extent: MagExtent,
        remaining: usize,
        callback: F,
    ) where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<MagCalibration, Error>) + 'static,
    {
        if remaining == 0 {
            let result = extent
                .solve(self.config.mag_scale.resolution(), self.mag_adjust)
                .ok_or(Error::NoCalibrationData);
            if let Ok(cal) = result {
                self.config.mag_bias = cal.bias;
                self.config.mag_scale_factors = cal.scale;
                info!("ak8963: calibrated from {} samples", extent.samples());
            }
            return callback(bus, self, result);
        }

        if !self.config.mag_mode.polls_data_ready() {
            return self.mag_cal_sample(bus, extent, remaining, callback);
        }

        // Single mode powers down after each measurement; start the next one.
        let control = ll::mag_control(self.config.mag_scale, self.config.mag_mode);
        bus.write_single(AK8963_ADDRESS, ak::CNTL, control, MAG_SETTLE, move |bus, status| {
            match status {
                StatusCode::Ok => self.mag_cal_sample(bus, extent, remaining, callback),
                status => callback(bus, self, Err(Error::Transfer(status))),
            }
        });
    }

    fn mag_cal_sample<T, C, F>(
        self,
        bus: &mut Bus<T, C>,
        mut extent: MagExtent,
        remaining: usize,
        callback: F,
    ) where
        T: Transport + 'static,
        C: Clock + 'static,
        F: FnOnce(&mut Bus<T, C>, Self, Result<MagCalibration, Error>) + 'static,
    {
        self.read(bus, AK8963_ADDRESS, ak::XOUT_L, ak::MAG_LEN, move |bus, this, result| {
            let (raw, st2) = match result.and_then(|bytes| exact::<{ ak::MAG_LEN }>(&bytes)) {
                Ok(bytes) => decode_mag(&bytes),
                Err(err) => return callback(bus, this, Err(err)),
            };
            if st2.contains(Status2::HOFL) {
                trace!("ak8963: overflowed calibration sample skipped");
            } else {
                extent.record(raw);
            }

            if remaining == 1 {
                this.mag_cal_step(bus, extent, 0, callback);
            } else {
                let interval = mag_interval(this.config.mag_mode);
                bus.post_after(interval, move |bus| {
                    this.mag_cal_step(bus, extent, remaining - 1, callback)
                });
            }
        });
    }
}

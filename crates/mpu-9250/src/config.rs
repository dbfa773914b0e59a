use crate::ll::{AccelScale, GyroScale, MagMode, MagScale};
use crate::madgwick::DEFAULT_BETA;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mpu9250Config {
    pub accel_scale: AccelScale,
    pub gyro_scale: GyroScale,
    pub mag_scale: MagScale,
    pub mag_mode: MagMode,
    /// Hard-iron offset in mG, subtracted from every magnetometer sample.
    /// Axes are +North, +East, +Down.
    pub mag_bias: [f32; 3],
    /// Soft-iron correction, multiplied in after the bias.
    pub mag_scale_factors: [f32; 3],
    /// Accelerometer offset in g.
    pub accel_bias: [f32; 3],
    /// Gyroscope offset in degrees per second.
    pub gyro_bias: [f32; 3],
    /// Madgwick filter gain.
    pub beta: f32,
}

impl Default for Mpu9250Config {
    fn default() -> Self {
        Self {
            accel_scale: AccelScale::G2,
            gyro_scale: GyroScale::Dps250,
            mag_scale: MagScale::Bits16,
            mag_mode: MagMode::Continuous100Hz,
            mag_bias: [0.0; 3],
            mag_scale_factors: [1.0; 3],
            accel_bias: [0.0; 3],
            gyro_bias: [0.0; 3],
            beta: DEFAULT_BETA,
        }
    }
}

impl Mpu9250Config {
    pub fn set_mag_bias(&mut self, north: f32, east: f32, down: f32) {
        self.mag_bias = [north, east, down];
    }
}

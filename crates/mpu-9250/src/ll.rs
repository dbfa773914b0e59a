//! Low level register map and field definitions.
use bitflags::bitflags;

/// MPU-9250 slave address with AD0 low.
pub const MPU9250_ADDRESS: u8 = 0x68;
/// AK8963 magnetometer, reachable once the MPU's I2C bypass is enabled.
pub const AK8963_ADDRESS: u8 = 0x0C;

/// Expected WHO_AM_I of the MPU-9250.
pub const MPU9250_ID: u8 = 0x71;
/// Expected WIA of the AK8963.
pub const AK8963_ID: u8 = 0x48;

pub mod mpu {
    pub const SMPLRT_DIV: u8 = 0x19;
    pub const CONFIG: u8 = 0x1A;
    pub const GYRO_CONFIG: u8 = 0x1B;
    pub const ACCEL_CONFIG: u8 = 0x1C;
    pub const ACCEL_CONFIG2: u8 = 0x1D;
    pub const INT_PIN_CFG: u8 = 0x37;
    pub const INT_ENABLE: u8 = 0x38;
    pub const INT_STATUS: u8 = 0x3A;
    pub const ACCEL_XOUT_H: u8 = 0x3B;
    pub const TEMP_OUT_H: u8 = 0x41;
    pub const GYRO_XOUT_H: u8 = 0x43;
    pub const PWR_MGMT_1: u8 = 0x6B;
    pub const PWR_MGMT_2: u8 = 0x6C;
    pub const WHO_AM_I: u8 = 0x75;

    /// PWR_MGMT_1: device reset.
    pub const H_RESET: u8 = 0x80;
    /// PWR_MGMT_1: auto-select the best clock (PLL when ready).
    pub const CLKSEL_PLL: u8 = 0x01;
    /// CONFIG: gyro bandwidth 41 Hz, 1 kHz internal rate.
    pub const DLPF_41HZ: u8 = 0x03;
    /// SMPLRT_DIV: 1 kHz / (1 + 4) = 200 Hz.
    pub const RATE_200HZ: u8 = 0x04;
    /// ACCEL_CONFIG2: accel bandwidth 41 Hz, 1 kHz rate.
    pub const A_DLPF_41HZ: u8 = 0x03;
    /// INT_PIN_CFG: latch until cleared, I2C bypass to the magnetometer.
    pub const LATCH_BYPASS: u8 = 0x22;
    /// INT_ENABLE: raw data ready.
    pub const RAW_RDY_EN: u8 = 0x01;

    /// Bytes from ACCEL_XOUT_H through GYRO_ZOUT_L.
    pub const ACCEL_GYRO_LEN: usize = 14;
}

pub mod ak {
    pub const WIA: u8 = 0x00;
    pub const ST1: u8 = 0x02;
    pub const XOUT_L: u8 = 0x03;
    pub const ST2: u8 = 0x09;
    pub const CNTL: u8 = 0x0A;
    pub const ASAX: u8 = 0x10;

    pub const POWER_DOWN: u8 = 0x00;
    pub const FUSE_ROM: u8 = 0x0F;

    /// Six data bytes plus ST2, which must be read to end the measurement.
    pub const MAG_LEN: usize = 7;
}

bitflags! {
    /// AK8963 ST1.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Status1: u8 {
        /// Data ready.
        const DRDY = 0b0000_0001;
        /// Data overrun: a sample was skipped.
        const DOR  = 0b0000_0010;
    }
}

bitflags! {
    /// AK8963 ST2.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Status2: u8 {
        /// Magnetic sensor overflow; the sample is invalid.
        const HOFL = 0b0000_1000;
        /// Output is 16 bit.
        const BITM = 0b0001_0000;
    }
}

/// Accelerometer full-scale range.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AccelScale {
    #[default]
    G2 = 0,
    G4 = 1,
    G8 = 2,
    G16 = 3,
}

impl AccelScale {
    /// ACCEL_CONFIG value (AFS_SEL in bits 4:3).
    pub const fn bits(self) -> u8 {
        (self as u8) << 3
    }

    /// g per LSB.
    pub fn resolution(self) -> f32 {
        let range = match self {
            Self::G2 => 2.0,
            Self::G4 => 4.0,
            Self::G8 => 8.0,
            Self::G16 => 16.0,
        };
        range / 32768.0
    }
}

/// Gyroscope full-scale range.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum GyroScale {
    #[default]
    Dps250 = 0,
    Dps500 = 1,
    Dps1000 = 2,
    Dps2000 = 3,
}

impl GyroScale {
    /// GYRO_CONFIG value (FS_SEL in bits 4:3).
    pub const fn bits(self) -> u8 {
        (self as u8) << 3
    }

    /// Degrees per second per LSB.
    pub fn resolution(self) -> f32 {
        let range = match self {
            Self::Dps250 => 250.0,
            Self::Dps500 => 500.0,
            Self::Dps1000 => 1000.0,
            Self::Dps2000 => 2000.0,
        };
        range / 32768.0
    }
}

/// Magnetometer output resolution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MagScale {
    Bits14 = 0,
    #[default]
    Bits16 = 1,
}

impl MagScale {
    /// Milligauss per LSB.
    pub fn resolution(self) -> f32 {
        match self {
            Self::Bits14 => 10.0 * 4912.0 / 8190.0,
            Self::Bits16 => 10.0 * 4912.0 / 32760.0,
        }
    }
}

/// Magnetometer measurement mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MagMode {
    /// Single measurement per request; ST1 has to be polled.
    Single = 0x01,
    /// Continuous measurement at 8 Hz.
    Continuous8Hz = 0x02,
    /// Continuous measurement at 100 Hz.
    #[default]
    Continuous100Hz = 0x06,
}

impl MagMode {
    /// Modes with bit 0 set need the data-ready flag checked before reading.
    pub const fn polls_data_ready(self) -> bool {
        (self as u8) & 0x01 != 0
    }
}

/// AK8963 CNTL value selecting `scale` and `mode`.
pub const fn mag_control(scale: MagScale, mode: MagMode) -> u8 {
    (scale as u8) << 4 | mode as u8
}

//! Madgwick gradient-descent orientation filter for 9-DoF (MARG) input.
//!
//! S. Madgwick, "An efficient orientation filter for inertial and
//! inertial/magnetic sensor arrays", 2010.

use core::f32::consts::PI;

#[allow(unused_imports)]
use micromath::F32Ext;
use micromath::vector::F32x3;
use micromath::Quaternion;

/// Expected gyroscope measurement error, 40 deg/s in rad/s.
const GYRO_MEASUREMENT_ERROR: f32 = PI * (40.0 / 180.0);

/// sqrt(3/4) times the expected gyroscope error.
pub const DEFAULT_BETA: f32 = 0.866_025_4 * GYRO_MEASUREMENT_ERROR;

#[derive(Debug, Clone, Copy)]
pub struct MadgwickFilter {
    beta: f32,
    q: Quaternion,
}

impl Default for MadgwickFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BETA)
    }
}

impl MadgwickFilter {
    pub const fn new(beta: f32) -> Self {
        Self { beta, q: Quaternion::IDENTITY }
    }

    pub fn beta(&self) -> f32 {
        self.beta
    }

    /// Current estimate as (w, x, y, z).
    pub fn quaternion(&self) -> Quaternion {
        self.q
    }

    pub fn reset(&mut self) {
        self.q = Quaternion::IDENTITY;
    }

    /// Fuse one sample. `gyro` in rad/s, `dt` in seconds. Accelerometer and
    /// magnetometer units do not matter; both are normalised. A sample with
    /// a zero-length accelerometer or magnetometer vector is skipped.
    pub fn update(&mut self, accel: F32x3, gyro: F32x3, mag: F32x3, dt: f32) -> Quaternion {
        let Some([ax, ay, az]) = normalized(accel) else {
            return self.q;
        };
        let Some([mx, my, mz]) = normalized(mag) else {
            return self.q;
        };
        let (gx, gy, gz) = (gyro.x, gyro.y, gyro.z);
        let (q1, q2, q3, q4) = (self.q.w(), self.q.x(), self.q.y(), self.q.z());

        let _2q1 = 2.0 * q1;
        let _2q2 = 2.0 * q2;
        let _2q3 = 2.0 * q3;
        let _2q4 = 2.0 * q4;
        let _2q1q3 = 2.0 * q1 * q3;
        let _2q3q4 = 2.0 * q3 * q4;
        let q1q1 = q1 * q1;
        let q1q2 = q1 * q2;
        let q1q3 = q1 * q3;
        let q1q4 = q1 * q4;
        let q2q2 = q2 * q2;
        let q2q3 = q2 * q3;
        let q2q4 = q2 * q4;
        let q3q3 = q3 * q3;
        let q3q4 = q3 * q4;
        let q4q4 = q4 * q4;

        // Reference direction of the earth's magnetic field.
        let _2q1mx = 2.0 * q1 * mx;
        let _2q1my = 2.0 * q1 * my;
        let _2q1mz = 2.0 * q1 * mz;
        let _2q2mx = 2.0 * q2 * mx;
        let hx = mx * q1q1 - _2q1my * q4 + _2q1mz * q3 + mx * q2q2 + _2q2 * my * q3
            + _2q2 * mz * q4
            - mx * q3q3
            - mx * q4q4;
        let hy = _2q1mx * q4 + my * q1q1 - _2q1mz * q2 + _2q2mx * q3 - my * q2q2
            + my * q3q3
            + _2q3 * mz * q4
            - my * q4q4;
        let _2bx = (hx * hx + hy * hy).sqrt();
        let _2bz = -_2q1mx * q3 + _2q1my * q2 + mz * q1q1 + _2q2mx * q4 - mz * q2q2
            + _2q3 * my * q4
            - mz * q3q3
            + mz * q4q4;
        let _4bx = 2.0 * _2bx;
        let _4bz = 2.0 * _2bz;

        // Objective function terms shared by the gradient.
        let fa_x = 2.0 * q2q4 - _2q1q3 - ax;
        let fa_y = 2.0 * q1q2 + _2q3q4 - ay;
        let fa_z = 1.0 - 2.0 * q2q2 - 2.0 * q3q3 - az;
        let fm_x = _2bx * (0.5 - q3q3 - q4q4) + _2bz * (q2q4 - q1q3) - mx;
        let fm_y = _2bx * (q2q3 - q1q4) + _2bz * (q1q2 + q3q4) - my;
        let fm_z = _2bx * (q1q3 + q2q4) + _2bz * (0.5 - q2q2 - q3q3) - mz;

        let s1 = -_2q3 * fa_x + _2q2 * fa_y - _2bz * q3 * fm_x
            + (-_2bx * q4 + _2bz * q2) * fm_y
            + _2bx * q3 * fm_z;
        let s2 = _2q4 * fa_x + _2q1 * fa_y - 4.0 * q2 * fa_z
            + _2bz * q4 * fm_x
            + (_2bx * q3 + _2bz * q1) * fm_y
            + (_2bx * q4 - _4bz * q2) * fm_z;
        let s3 = -_2q1 * fa_x + _2q4 * fa_y - 4.0 * q3 * fa_z
            + (-_4bx * q3 - _2bz * q1) * fm_x
            + (_2bx * q2 + _2bz * q4) * fm_y
            + (_2bx * q1 - _4bz * q3) * fm_z;
        let s4 = _2q2 * fa_x + _2q3 * fa_y
            + (-_4bx * q4 + _2bz * q2) * fm_x
            + (-_2bx * q1 + _2bz * q3) * fm_y
            + _2bx * q2 * fm_z;
        let [s1, s2, s3, s4] = normalized4([s1, s2, s3, s4]).unwrap_or([0.0; 4]);

        // Rate of change from the gyro, corrected along the gradient.
        let q_dot1 = 0.5 * (-q2 * gx - q3 * gy - q4 * gz) - self.beta * s1;
        let q_dot2 = 0.5 * (q1 * gx + q3 * gz - q4 * gy) - self.beta * s2;
        let q_dot3 = 0.5 * (q1 * gy - q2 * gz + q4 * gx) - self.beta * s3;
        let q_dot4 = 0.5 * (q1 * gz + q2 * gy - q3 * gx) - self.beta * s4;

        let integrated = [
            q1 + q_dot1 * dt,
            q2 + q_dot2 * dt,
            q3 + q_dot3 * dt,
            q4 + q_dot4 * dt,
        ];
        if let Some([w, x, y, z]) = normalized4(integrated) {
            self.q = Quaternion::new(w, x, y, z);
        }
        self.q
    }
}

fn normalized(v: F32x3) -> Option<[f32; 3]> {
    let norm = (v.x * v.x + v.y * v.y + v.z * v.z).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    let inv = 1.0 / norm;
    Some([v.x * inv, v.y * inv, v.z * inv])
}

fn normalized4(v: [f32; 4]) -> Option<[f32; 4]> {
    let norm = v.iter().map(|c| c * c).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    let inv = 1.0 / norm;
    Some(v.map(|c| c * inv))
}

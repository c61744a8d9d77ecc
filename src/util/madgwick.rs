//! Madgwick orientation filter, IMU (gyroscope + accelerometer) variant.
//!
//! Integrates the gyroscope rate and corrects drift with one gradient-descent
//! step toward the measured gravity direction per update. Without a
//! magnetometer the yaw is unobservable and only integrates.

use libm::{asinf, atan2f, sqrtf};

/// Unit quaternion `w + xi + yj + zk`, sensor frame relative to earth frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    pub const IDENTITY: Self = Self {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Roll, pitch and yaw in radians
    pub fn euler(&self) -> (f32, f32, f32) {
        let Self { w, x, y, z } = *self;
        let roll = atan2f(2.0 * (w * x + y * z), 1.0 - 2.0 * (x * x + y * y));
        let pitch = asinf((2.0 * (w * y - z * x)).clamp(-1.0, 1.0));
        let yaw = atan2f(2.0 * (w * z + x * y), 1.0 - 2.0 * (y * y + z * z));
        (roll, pitch, yaw)
    }
}

fn inv_sqrt(v: f32) -> f32 {
    1.0 / sqrtf(v)
}

#[derive(Debug, Clone)]
pub struct Madgwick {
    /// Gradient-descent gain
    beta: f32,
    q: Quaternion,
}

impl Madgwick {
    pub fn new(beta: f32) -> Self {
        Self {
            beta,
            q: Quaternion::IDENTITY,
        }
    }

    pub fn quaternion(&self) -> Quaternion {
        self.q
    }

    /// Fuse one sample
    ///
    /// # Arguments
    /// * `gyro` - Angular rate in rad/s
    /// * `accel` - Acceleration in any unit; an all-zero reading skips the correction
    /// * `dt` - Seconds since the previous update
    pub fn update(&mut self, gyro: [f32; 3], accel: [f32; 3], dt: f32) {
        let Quaternion {
            w: q0,
            x: q1,
            y: q2,
            z: q3,
        } = self.q;
        let [gx, gy, gz] = gyro;

        // Rate of change from the gyroscope
        let mut d0 = 0.5 * (-q1 * gx - q2 * gy - q3 * gz);
        let mut d1 = 0.5 * (q0 * gx + q2 * gz - q3 * gy);
        let mut d2 = 0.5 * (q0 * gy - q1 * gz + q3 * gx);
        let mut d3 = 0.5 * (q0 * gz + q1 * gy - q2 * gx);

        let [ax, ay, az] = accel;
        let norm = ax * ax + ay * ay + az * az;
        if norm > 0.0 {
            let r = inv_sqrt(norm);
            let (ax, ay, az) = (ax * r, ay * r, az * r);

            let (q0q0, q1q1, q2q2, q3q3) = (q0 * q0, q1 * q1, q2 * q2, q3 * q3);
            let s0 = 4.0 * q0 * q2q2 + 2.0 * q2 * ax + 4.0 * q0 * q1q1 - 2.0 * q1 * ay;
            let s1 = 4.0 * q1 * q3q3 - 2.0 * q3 * ax + 4.0 * q0q0 * q1 - 2.0 * q0 * ay - 4.0 * q1
                + 8.0 * q1 * q1q1
                + 8.0 * q1 * q2q2
                + 4.0 * q1 * az;
            let s2 = 4.0 * q0q0 * q2 + 2.0 * q0 * ax + 4.0 * q2 * q3q3 - 2.0 * q3 * ay - 4.0 * q2
                + 8.0 * q2 * q1q1
                + 8.0 * q2 * q2q2
                + 4.0 * q2 * az;
            let s3 = 4.0 * q1q1 * q3 - 2.0 * q1 * ax + 4.0 * q2q2 * q3 - 2.0 * q2 * ay;

            let s_norm = s0 * s0 + s1 * s1 + s2 * s2 + s3 * s3;
            if s_norm > 0.0 {
                let r = inv_sqrt(s_norm);
                d0 -= self.beta * s0 * r;
                d1 -= self.beta * s1 * r;
                d2 -= self.beta * s2 * r;
                d3 -= self.beta * s3 * r;
            }
        }

        let (q0, q1, q2, q3) = (q0 + d0 * dt, q1 + d1 * dt, q2 + d2 * dt, q3 + d3 * dt);
        let r = inv_sqrt(q0 * q0 + q1 * q1 + q2 * q2 + q3 * q3);
        self.q = Quaternion {
            w: q0 * r,
            x: q1 * r,
            y: q2 * r,
            z: q3 * r,
        };
    }
}

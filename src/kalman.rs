// SPDX-License-Identifier: Apache-2.0
//! Constant-velocity Kalman filter for the ride-height sensor.
//!
//! State is `[position, velocity]` with a scalar position measurement.
//! Process noise follows the white-acceleration model: an unknown
//! acceleration with variance σ<sub>a</sub>² acting over the prediction
//! interval. Pure math, no I/O, no allocation.

/// Constant-velocity filter over a scalar position measurement.
#[derive(Clone, Copy, Debug)]
pub struct RangeFilter {
    x: f32,
    v: f32,
    /// Covariance matrix, row-major: [[p11, p12], [p21, p22]].
    p: [[f32; 2]; 2],
    /// Measurement variance R.
    r: f32,
    /// White-acceleration variance σ_a².
    accel_variance: f32,
}

impl RangeFilter {
    /// Create a filter with the given measurement variance and acceleration
    /// variance, starting at rest with a large initial uncertainty.
    pub fn new(measurement_variance: f32, accel_variance: f32) -> Self {
        Self {
            x: 0.0,
            v: 0.0,
            p: [[100.0, 0.0], [0.0, 100.0]],
            r: measurement_variance,
            accel_variance,
        }
    }

    pub fn position(&self) -> f32 {
        self.x
    }

    pub fn velocity(&self) -> f32 {
        self.v
    }

    /// Advance the state by `dt` seconds.
    ///
    /// Propagates the covariance as `F·P·Fᵀ + Q(dt)` with
    /// `F = [[1, dt], [0, 1]]` and the closed-form white-acceleration
    /// process noise.
    pub fn predict(&mut self, dt: f32) {
        self.x += self.v * dt;

        let dt2 = dt * dt;
        let q11 = 0.25 * dt2 * dt2 * self.accel_variance;
        let q12 = 0.5 * dt2 * dt * self.accel_variance;
        let q22 = dt2 * self.accel_variance;

        let [[p11, p12], [p21, p22]] = self.p;
        self.p = [
            [p11 + dt * (p21 + p12) + dt2 * p22 + q11, p12 + dt * p22 + q12],
            [p21 + dt * p22 + q12, p22 + q22],
        ];
    }

    /// Fold in a position measurement `z`.
    pub fn update(&mut self, z: f32) {
        let innovation = z - self.x;
        let s = self.p[0][0] + self.r;
        let k1 = self.p[0][0] / s;
        let k2 = self.p[1][0] / s;

        self.x += k1 * innovation;
        self.v += k2 * innovation;

        // P = (I - K·H)·P with H = [1, 0].
        let [[p11, p12], [p21, p22]] = self.p;
        self.p = [
            [p11 - k1 * p11, p12 - k1 * p12],
            [p21 - k2 * p11, p22 - k2 * p12],
        ];
    }
}

#[cfg(test)]
mod test {
    use float_cmp::assert_approx_eq;

    use super::RangeFilter;

    #[test]
    fn zero_dt_prediction_is_a_fixpoint() {
        let mut filter = RangeFilter::new(4.0, 1.0);
        filter.update(120.0);
        let (x, v, p) = (filter.x, filter.v, filter.p);
        filter.predict(0.0);
        assert_eq!(filter.x, x);
        assert_eq!(filter.v, v);
        assert_eq!(filter.p, p);
    }

    #[test]
    fn prediction_grows_uncertainty() {
        let mut filter = RangeFilter::new(4.0, 1.0);
        filter.update(120.0);
        let p_before = filter.p;
        filter.predict(0.05);
        assert!(filter.p[0][0] > p_before[0][0]);
        assert!(filter.p[1][1] > p_before[1][1]);
    }

    #[test]
    fn update_at_the_estimate_only_sharpens_covariance() {
        let mut filter = RangeFilter::new(4.0, 1.0);
        filter.predict(0.05);
        let x = filter.x;
        let p11_before = filter.p[0][0];
        filter.update(x);
        assert_eq!(filter.x, x);
        assert!(
            filter.p[0][0] < p11_before,
            "a measurement must strictly reduce position uncertainty when R > 0"
        );
    }

    #[test]
    fn converges_to_a_constant_input() {
        let mut filter = RangeFilter::new(4.0, 2.0);
        for _ in 0..200 {
            filter.predict(0.05);
            filter.update(80.0);
        }
        assert_approx_eq!(f32, filter.position(), 80.0, epsilon = 0.01);
        assert_approx_eq!(f32, filter.velocity(), 0.0, epsilon = 0.01);
    }

    #[test]
    fn tracks_a_ramp() {
        // 100 mm/s ramp sampled at 20 Hz; velocity should settle near the
        // true slope.
        let mut filter = RangeFilter::new(1.0, 10.0);
        let mut z = 50.0;
        for _ in 0..400 {
            filter.predict(0.05);
            z += 5.0;
            filter.update(z);
        }
        assert_approx_eq!(f32, filter.velocity(), 100.0, epsilon = 1.0);
        assert_approx_eq!(f32, filter.position(), z, epsilon = 2.0);
    }
}

//! PID controller with integral clamping and output limits.

/// Gains and limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// The integral term is held within `±integral_limit`
    pub integral_limit: f32,
    pub output_min: f32,
    pub output_max: f32,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            integral_limit: 1.0,
            output_min: -1.0,
            output_max: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pid {
    config: PidConfig,
    integral: f32,
    previous_error: Option<f32>,
}

impl Pid {
    pub fn new(config: PidConfig) -> Self {
        Self {
            config,
            integral: 0.0,
            previous_error: None,
        }
    }

    /// Advance the controller by one step
    ///
    /// # Arguments
    /// * `setpoint` - Desired value
    /// * `measurement` - Current value
    /// * `dt` - Seconds since the previous update; non-positive steps skip the I and D terms
    ///
    /// # Returns
    /// * Control output clamped to `[output_min, output_max]`
    pub fn update(&mut self, setpoint: f32, measurement: f32, dt: f32) -> f32 {
        let c = &self.config;
        let error = setpoint - measurement;
        let mut derivative = 0.0;
        if dt > 0.0 {
            self.integral =
                (self.integral + error * dt).clamp(-c.integral_limit, c.integral_limit);
            if let Some(previous) = self.previous_error {
                derivative = (error - previous) / dt;
            }
        }
        self.previous_error = Some(error);
        let output = c.kp * error + c.ki * self.integral + c.kd * derivative;
        output.clamp(c.output_min, c.output_max)
    }

    /// Clear the integral and derivative history
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = None;
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }
}

//! Per-device constants and the small registry `Config` resolves a
//! `model` string against.

use crate::error::ConfigError;

/// Per-device constants: step resolution, travel envelope, and the
/// derived `steps_per_mm` once microstepping is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceModel {
    pub name: &'static str,
    pub native_steps_per_mm: f64,
    pub native_steps_per_inch: f64,
    pub travel_x_mm: f64,
    pub travel_y_mm: f64,
    pub pen_travel_mm: f64,
    pub max_carriage_speed_mm_s: f64,
}

impl DeviceModel {
    /// `stepsPerMm = nativeStepsPerMm / 2^(microstepping-1)`.
    pub fn steps_per_mm(&self, microstepping_mode: u8) -> f64 {
        self.native_steps_per_mm / 2f64.powi((microstepping_mode as i32) - 1)
    }

    /// AxiDraw-class carriage, the default device model.
    pub const MINI_KIT_2: DeviceModel = DeviceModel {
        name: "MiniKit2",
        native_steps_per_mm: 80.0,
        native_steps_per_inch: 2032.0,
        travel_x_mm: 300.0,
        travel_y_mm: 218.0,
        pen_travel_mm: 20.0,
        max_carriage_speed_mm_s: 380.0,
    };

    /// Scaled-down predecessor: shorter travel, lower top carriage speed.
    pub const MINI_KIT_1: DeviceModel = DeviceModel {
        name: "MiniKit1",
        native_steps_per_mm: 80.0,
        native_steps_per_inch: 2032.0,
        travel_x_mm: 215.0,
        travel_y_mm: 150.0,
        pen_travel_mm: 14.0,
        max_carriage_speed_mm_s: 250.0,
    };

    /// Looks up a model by the name accepted in configuration.
    pub fn lookup(name: &str) -> Result<DeviceModel, ConfigError> {
        match name {
            "MiniKit2" => Ok(Self::MINI_KIT_2),
            "MiniKit1" => Ok(Self::MINI_KIT_1),
            other => Err(ConfigError::UnknownModel(other.to_string())),
        }
    }
}

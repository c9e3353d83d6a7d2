use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::EngineError;

pub const CONFIG_FILE_NAME: &str = "fluid_backdrop.json";

/// Longest simulated step. Slower frames lose the excess instead of sub-stepping.
pub const MAX_TIME_STEP: f32 = 1.0 / 60.0;

/// Per-run simulation options. Immutable once the engine is initialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub sim_resolution: u32,
    pub dye_resolution: u32,
    pub density_dissipation: f32,
    pub velocity_dissipation: f32,
    pub pressure_dissipation: f32,
    pub pressure_iterations: u32,
    pub curl: f32,
    pub splat_radius: f32, // percent; divided by 100 before it reaches the shaders
    pub splat_force: f32,
    pub color_update_speed: f32,
    pub shading: bool,
    pub colorful: bool,
    pub paused: bool,
    pub back_color: [f32; 3],
    pub transparent: bool,
    /// Scale the previous pressure by `pressure_dissipation` instead of zeroing it.
    pub warm_start_pressure: bool,
    /// Random splats queued at start-up. 0 picks a random count.
    pub initial_burst: u32,
    /// Seconds without pointer activity before an ambient burst is queued.
    pub idle_burst_interval: Option<f32>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sim_resolution: 128,
            dye_resolution: 512,
            density_dissipation: 0.97,
            velocity_dissipation: 0.98,
            pressure_dissipation: 0.8,
            pressure_iterations: 25,
            curl: 30.0,
            splat_radius: 0.25,
            splat_force: 6000.0,
            color_update_speed: 10.0,
            shading: true,
            colorful: true,
            paused: false,
            back_color: [0.0, 0.0, 0.0],
            transparent: false,
            warm_start_pressure: false,
            initial_burst: 0,
            idle_burst_interval: None,
        }
    }
}

impl SimulationConfig {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(CONFIG_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn save_to_disk(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Rejects values the solver cannot run with at all. Free parameters
    /// (curl, splat radius, splat force) are only checked for finiteness and
    /// are never clamped.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sim_resolution == 0 || self.dye_resolution == 0 {
            return Err(EngineError::Config("resolutions must be non-zero".into()));
        }
        if self.pressure_iterations == 0 {
            return Err(EngineError::Config("pressure_iterations must be at least 1".into()));
        }
        for (name, value) in [
            ("density_dissipation", self.density_dissipation),
            ("velocity_dissipation", self.velocity_dissipation),
            ("pressure_dissipation", self.pressure_dissipation),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(EngineError::Config(format!("{name} must be in (0, 1], got {value}")));
            }
        }
        for (name, value) in [
            ("curl", self.curl),
            ("splat_radius", self.splat_radius),
            ("splat_force", self.splat_force),
            ("color_update_speed", self.color_update_speed),
        ] {
            if !value.is_finite() {
                return Err(EngineError::Config(format!("{name} must be finite")));
            }
        }
        if self.back_color.iter().any(|c| !c.is_finite()) {
            return Err(EngineError::Config("back_color must be finite".into()));
        }
        if let Some(interval) = self.idle_burst_interval {
            if !(interval.is_finite() && interval > 0.0) {
                return Err(EngineError::Config("idle_burst_interval must be positive".into()));
            }
        }
        Ok(())
    }

    /// Background as an RGBA clear value for the surface. Dye is composited over it.
    pub fn background(&self) -> [f32; 4] {
        let [r, g, b] = self.back_color;
        if self.transparent {
            [0.0, 0.0, 0.0, 0.0]
        } else {
            [r, g, b, 1.0]
        }
    }

    pub(crate) fn pressure_reset_factor(&self) -> f32 {
        if self.warm_start_pressure {
            self.pressure_dissipation
        } else {
            0.0
        }
    }
}

use std::{path::Path, time::Duration};

use crate::{
    compute::recorder::group_count,
    device::kernel::KernelSpec,
    foundation::{
        core::{Canvas, TileSize},
        error::{FractError, FractResult},
    },
};

/// How the Y group count of a dispatch is rounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchRounding {
    /// `ceil(extent / group)` on both axes.
    #[default]
    Ceil,
    /// `(extent + group) / group` on Y: one extra group row even when the tile divides evenly.
    /// The kernel guards the surplus invocations, so the image is unchanged.
    LegacyOverflow,
}

/// Submission strategy for the two lane batches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// One control flow submits both lanes, then waits on both fences together.
    #[default]
    Joint,
    /// One worker per lane owns submit, wait and reset for its own queue.
    Threaded,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubmitConfig {
    pub mode: SubmitMode,
    /// Number of sub-batches each lane's recorded buffers are split into.
    pub iterations: u32,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            mode: SubmitMode::Joint,
            iterations: 1,
        }
    }
}

/// Validation settings, resolved once at startup and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    pub enabled: bool,
    /// Name of the validation layer to request from drivers that have one.
    pub layer: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            layer: "VK_LAYER_KHRONOS_validation".to_string(),
        }
    }
}

/// Complete description of one render run.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    pub canvas: Canvas,
    pub tile: TileSize,
    pub group_size: u32,
    pub dispatch_rounding: DispatchRounding,
    pub submit: SubmitConfig,
    pub fence_timeout_ms: u64,
    pub kernel: KernelSpec,
    pub validation: ValidationConfig,
    pub device_index: usize,
    pub require_independent_queues: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            canvas: Canvas::default(),
            tile: TileSize::default(),
            group_size: 16,
            dispatch_rounding: DispatchRounding::default(),
            submit: SubmitConfig::default(),
            fence_timeout_ms: 100_000,
            kernel: KernelSpec::default(),
            validation: ValidationConfig::default(),
            device_index: 0,
            require_independent_queues: false,
        }
    }
}

impl RenderConfig {
    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> FractResult<Self> {
        serde_json::from_str(s).map_err(|e| FractError::config(format!("invalid config JSON: {e}")))
    }

    pub fn from_json_file(path: &Path) -> FractResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FractError::config(format!("read config '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Reject configurations that cannot be run. Called before any device work.
    pub fn validate(&self) -> FractResult<()> {
        Canvas::new(self.canvas.width, self.canvas.height)?;
        if self.tile.width == 0 || self.tile.height == 0 {
            return Err(FractError::config(format!(
                "tile must be non-empty, got {}",
                self.tile
            )));
        }
        if self.canvas.width % self.tile.width != 0 || self.canvas.height % self.tile.height != 0 {
            return Err(FractError::config(format!(
                "canvas {} is not an exact multiple of tile {}",
                self.canvas, self.tile
            )));
        }
        self.canvas.pixel_buffer_bytes()?;
        if self.group_size == 0 {
            return Err(FractError::config("group_size must be >= 1"));
        }
        group_count(self.tile.width, self.group_size, DispatchRounding::Ceil)?;
        group_count(self.tile.height, self.group_size, self.dispatch_rounding)?;
        if self.submit.iterations == 0 {
            return Err(FractError::config("submit.iterations must be >= 1"));
        }
        if self.fence_timeout_ms == 0 {
            return Err(FractError::config("fence_timeout_ms must be >= 1"));
        }
        self.kernel.validate()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/config.rs"]
mod tests;

use std::{
    fmt,
    path::Path,
    time::{Duration, Instant},
};

use crate::{
    compute::{
        commands::{CommandPool, DispatchSize},
        extract::ResultExtractor,
        recorder::CommandBuilder,
        scheduler::TileScheduler,
        submit::{QueueSubmitter, SubmitReport},
    },
    device::{
        backend::{BufferId, ComputeDevice, DeviceInfo, DeviceStats, KernelId, LaneTopology},
        kernel::KernelDesc,
    },
    foundation::{
        config::RenderConfig,
        core::{LaneId, RasterRgba8},
        error::{FractError, FractResult},
    },
    render::encode::{RasterFormat, write_raster},
};

/// Stages of one render run, in the only order they may be entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineStage {
    Uninitialized,
    Scheduled,
    Recording,
    Submitted,
    Synchronized,
    Extracted,
    Finalized,
}

impl PipelineStage {
    pub const ALL: [Self; 7] = [
        Self::Uninitialized,
        Self::Scheduled,
        Self::Recording,
        Self::Submitted,
        Self::Synchronized,
        Self::Extracted,
        Self::Finalized,
    ];

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Uninitialized => Some(Self::Scheduled),
            Self::Scheduled => Some(Self::Recording),
            Self::Recording => Some(Self::Submitted),
            Self::Submitted => Some(Self::Synchronized),
            Self::Synchronized => Some(Self::Extracted),
            Self::Extracted => Some(Self::Finalized),
            Self::Finalized => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Scheduled => "scheduled",
            Self::Recording => "recording",
            Self::Submitted => "submitted",
            Self::Synchronized => "synchronized",
            Self::Extracted => "extracted",
            Self::Finalized => "finalized",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Time spent in a stage before the next one was entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: PipelineStage,
    pub elapsed: Duration,
}

/// Strictly sequential stage tracker. There is no way back and no way to skip ahead.
#[derive(Debug)]
pub struct StageMachine {
    stage: PipelineStage,
    entered: Instant,
    timings: Vec<StageTiming>,
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StageMachine {
    pub fn new() -> Self {
        Self {
            stage: PipelineStage::Uninitialized,
            entered: Instant::now(),
            timings: Vec::with_capacity(PipelineStage::ALL.len()),
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn timings(&self) -> &[StageTiming] {
        &self.timings
    }

    pub fn advance(&mut self, to: PipelineStage) -> FractResult<()> {
        if self.stage.next() != Some(to) {
            return Err(FractError::state(format!(
                "illegal transition {} -> {to}",
                self.stage
            )));
        }
        let now = Instant::now();
        self.timings.push(StageTiming {
            stage: self.stage,
            elapsed: now - self.entered,
        });
        tracing::debug!(from = %self.stage, %to, "pipeline stage");
        self.stage = to;
        self.entered = now;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RenderReport {
    pub device: DeviceInfo,
    pub tiles: usize,
    pub lane_tiles: [usize; 2],
    /// Dispatch issued for every tile (all tiles share one size).
    pub dispatch: DispatchSize,
    pub submit: SubmitReport,
    pub timings: Vec<StageTiming>,
    /// Device counters at the end of the run, cumulative over the device's lifetime.
    pub stats: DeviceStats,
    pub final_stage: PipelineStage,
}

#[derive(Clone, Debug)]
pub struct RenderOutput {
    pub image: RasterRgba8,
    pub report: RenderReport,
}

struct BufferGuard<'d> {
    device: &'d dyn ComputeDevice,
    id: BufferId,
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_buffer(self.id) {
            tracing::warn!(buffer = ?self.id, error = %e, "failed to release pixel buffer");
        }
    }
}

struct KernelGuard<'d> {
    device: &'d dyn ComputeDevice,
    id: KernelId,
}

impl Drop for KernelGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_kernel(self.id) {
            tracing::warn!(kernel = ?self.id, error = %e, "failed to release kernel");
        }
    }
}

/// Schedule, record, submit, synchronize and extract one image.
///
/// Any failure aborts the run; the pixel buffer and kernel are released either way.
#[tracing::instrument(
    skip_all,
    fields(canvas = %cfg.canvas, tile = %cfg.tile, device = %device.info().name)
)]
pub fn render(device: &dyn ComputeDevice, cfg: &RenderConfig) -> FractResult<RenderOutput> {
    cfg.validate()?;
    if cfg.require_independent_queues && device.info().lanes != LaneTopology::Independent {
        return Err(FractError::config(format!(
            "device '{}' multiplexes both lanes on one queue; independent queues were required",
            device.info().name
        )));
    }

    let mut machine = StageMachine::new();
    let scheduler = TileScheduler::new(cfg.canvas, cfg.tile)?;

    let pixels = BufferGuard {
        device,
        id: device.create_storage_buffer(cfg.canvas.pixel_buffer_bytes()?)?,
    };
    let kernel = KernelGuard {
        device,
        id: device.create_kernel(&KernelDesc {
            spec: cfg.kernel.clone(),
            canvas: cfg.canvas,
            tile: cfg.tile,
            group_size: cfg.group_size,
        })?,
    };

    let schedule = scheduler.schedule();
    machine.advance(PipelineStage::Scheduled)?;

    machine.advance(PipelineStage::Recording)?;
    let builder =
        CommandBuilder::new(kernel.id, pixels.id, cfg.group_size, cfg.dispatch_rounding)?;
    let mut recorded = [Vec::new(), Vec::new()];
    for lane in LaneId::ALL {
        let mut pool = CommandPool::new(lane);
        recorded[lane.index()] = builder.record_lane(&mut pool, schedule.lane(lane))?;
    }
    let first = schedule
        .grid
        .tiles
        .first()
        .ok_or_else(|| FractError::state("schedule produced no tiles"))?;
    let dispatch = builder.dispatch_size(first)?;

    machine.advance(PipelineStage::Submitted)?;
    let submit = QueueSubmitter::new(device, cfg.submit.clone(), cfg.fence_timeout())
        .submit(recorded)?;
    machine.advance(PipelineStage::Synchronized)?;

    let image =
        ResultExtractor::new(device, cfg.fence_timeout()).extract(pixels.id, cfg.canvas)?;
    machine.advance(PipelineStage::Extracted)?;

    drop(kernel);
    drop(pixels);
    let stats = device.stats();
    machine.advance(PipelineStage::Finalized)?;

    tracing::info!(
        tiles = schedule.grid.len(),
        lane0 = schedule.lane(LaneId::Zero).len(),
        lane1 = schedule.lane(LaneId::One).len(),
        guarded = stats.guarded_invocations,
        "render finished"
    );
    Ok(RenderOutput {
        image,
        report: RenderReport {
            device: device.info().clone(),
            tiles: schedule.grid.len(),
            lane_tiles: schedule.lane_sizes(),
            dispatch,
            submit,
            timings: machine.timings().to_vec(),
            stats,
            final_stage: machine.stage(),
        },
    })
}

/// [`render`], then write the image. Nothing is written unless the run reached
/// [`PipelineStage::Finalized`].
pub fn render_to_file(
    device: &dyn ComputeDevice,
    cfg: &RenderConfig,
    path: &Path,
) -> FractResult<RenderOutput> {
    RasterFormat::from_path(path)?;
    let out = render(device, cfg)?;
    if out.report.final_stage != PipelineStage::Finalized {
        return Err(FractError::state(format!(
            "refusing to write an image from stage {}",
            out.report.final_stage
        )));
    }
    write_raster(&out.image, path)?;
    Ok(out)
}

#[cfg(test)]
#[path = "../../tests/unit/render/pipeline.rs"]
mod tests;

//! Tiled, dual-lane compute rendering of a parametric 2-D field into an RGBA8 raster.
//!
//! The canvas is cut into equal tiles, tiles are split between two lanes by a checkerboard
//! `(row + col) mod 2`, each tile becomes one recorded command buffer, both lanes are submitted
//! and fenced, and the finished pixel buffer is copied to a staging buffer and quantized.
//!
//! Devices sit behind [`ComputeDevice`]: a software reference device is always available, and a
//! wgpu device is built with the `gpu` feature.
#![forbid(unsafe_code)]

pub mod compute;
pub mod device;
pub mod foundation;
pub mod render;

pub use compute::{
    commands::{
        Command, CommandBuffer, CommandBufferState, CommandPool, DispatchSize,
        PIXEL_BUFFER_BINDING, TileParams,
    },
    extract::{ResultExtractor, quantize_channel},
    fence::{Fence, FenceStatus},
    recorder::{CommandBuilder, dispatch_for_tile, group_count, record_copy},
    scheduler::{Schedule, Tile, TileGrid, TileScheduler, assign_lane},
    submit::{IterationRecord, QueueSubmitter, SubmitReport},
};
pub use device::{
    backend::{
        BufferId, BufferKind, ComputeDevice, CpuDeviceOptions, DeviceInfo, DeviceKind,
        DeviceOptions, DeviceStats, KernelId, LaneTopology, create_device, parse_device_kind,
    },
    cpu::CpuDevice,
    kernel::{KernelDesc, KernelSpec, MandelbrotParams},
};
#[cfg(feature = "gpu")]
pub use device::gpu::GpuDevice;
pub use foundation::{
    config::{DispatchRounding, RenderConfig, SubmitConfig, SubmitMode, ValidationConfig},
    core::{Canvas, LaneId, Pixel, RasterRgba8, TileSize},
    diagnostics::{CollectingSink, Diagnostic, DiagnosticSink, Severity, TracingSink},
    error::{FractError, FractResult},
};
pub use render::{
    encode::{RasterFormat, write_raster},
    pipeline::{
        PipelineStage, RenderOutput, RenderReport, StageMachine, StageTiming, render,
        render_to_file,
    },
};

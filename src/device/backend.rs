use std::{fmt, sync::Arc, time::Duration};

use crate::{
    compute::{commands::CommandBuffer, fence::Fence},
    device::kernel::KernelDesc,
    foundation::{
        config::{RenderConfig, ValidationConfig},
        core::LaneId,
        diagnostics::DiagnosticSink,
        error::{FractError, FractResult},
    },
};

/// Device buffer handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u32);

/// Device kernel (pipeline) handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Device-resident, written by kernels, source of transfers. Not host visible.
    Storage,
    /// Host-visible transfer target.
    Staging,
}

/// How the two lanes map onto hardware queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaneTopology {
    /// Each lane owns its own queue.
    Independent,
    /// Both lanes are multiplexed onto one hardware queue.
    Shared,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    #[cfg(feature = "gpu")]
    Gpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            #[cfg(feature = "gpu")]
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub lanes: LaneTopology,
}

/// Counters accumulated by a device over its lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub submissions: u64,
    pub command_buffers: u64,
    pub dispatches: [u64; 2],
    /// Invocations that wrote a pixel.
    pub invocations: u64,
    /// Invocations that fell outside their tile or the canvas and wrote nothing.
    pub guarded_invocations: u64,
    pub copies: u64,
    pub validation_findings: u64,
}

/// Tuning knobs of the software device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuDeviceOptions {
    /// Sleep before executing each dispatch; models a slow or hung device.
    pub dispatch_delay: Option<Duration>,
    /// Row-parallel worker threads per dispatch; `None` lets rayon decide.
    pub threads: Option<usize>,
}

/// Startup options shared by every device kind.
#[derive(Clone, Default)]
pub struct DeviceOptions {
    pub validation: ValidationConfig,
    pub device_index: usize,
    pub diagnostics: Option<Arc<dyn DiagnosticSink>>,
    pub cpu: CpuDeviceOptions,
}

impl fmt::Debug for DeviceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceOptions")
            .field("validation", &self.validation)
            .field("device_index", &self.device_index)
            .field("diagnostics", &self.diagnostics.is_some())
            .field("cpu", &self.cpu)
            .finish()
    }
}

impl DeviceOptions {
    pub fn from_config(cfg: &RenderConfig, diagnostics: Option<Arc<dyn DiagnosticSink>>) -> Self {
        Self {
            validation: cfg.validation.clone(),
            device_index: cfg.device_index,
            diagnostics,
            cpu: CpuDeviceOptions::default(),
        }
    }
}

/// Device/context provider used by the tiling and submission core.
///
/// Implementations must be usable from two lane workers at once.
pub trait ComputeDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn create_storage_buffer(&self, bytes: u64) -> FractResult<BufferId>;

    fn create_staging_buffer(&self, bytes: u64) -> FractResult<BufferId>;

    fn destroy_buffer(&self, id: BufferId) -> FractResult<()>;

    fn create_kernel(&self, desc: &KernelDesc) -> FractResult<KernelId>;

    fn destroy_kernel(&self, id: KernelId) -> FractResult<()>;

    /// Queue `batch` on `lane`'s queue. Buffers execute in order; `fence` signals after the last.
    fn submit(&self, lane: LaneId, batch: Vec<CommandBuffer>, fence: &Fence) -> FractResult<()>;

    /// Block until every fence is signaled, or fail with [`FractError::Timeout`].
    fn wait_for_fences(&self, fences: &[&Fence], timeout: Duration) -> FractResult<()>;

    /// Map `len` bytes of a staging buffer at `offset` and hand them to `read`.
    fn map_read(
        &self,
        buffer: BufferId,
        offset: u64,
        len: u64,
        read: &mut dyn FnMut(&[u8]),
    ) -> FractResult<()>;

    fn stats(&self) -> DeviceStats;
}

/// Checks every device performs before accepting a submission.
pub fn check_submission(lane: LaneId, batch: &[CommandBuffer], fence: &Fence) -> FractResult<()> {
    if fence.is_signaled() {
        return Err(FractError::device(format!(
            "fence {} submitted while still signaled (reset it first)",
            fence.id()
        )));
    }
    for cb in batch {
        if cb.lane() != lane {
            return Err(FractError::device(format!(
                "command buffer {:?} from a {} pool submitted to {lane}",
                cb.id(),
                cb.lane()
            )));
        }
        if !cb.is_executable() {
            return Err(FractError::device(format!(
                "command buffer {:?} is not executable ({:?})",
                cb.id(),
                cb.state()
            )));
        }
    }
    Ok(())
}

pub fn create_device(kind: DeviceKind, opts: &DeviceOptions) -> FractResult<Box<dyn ComputeDevice>> {
    tracing::info!(%kind, validation = opts.validation.enabled, "creating device");
    match kind {
        DeviceKind::Cpu => Ok(Box::new(crate::device::cpu::CpuDevice::new(opts.clone())?)),
        #[cfg(feature = "gpu")]
        DeviceKind::Gpu => Ok(Box::new(crate::device::gpu::GpuDevice::new(opts.clone())?)),
    }
}

/// Parse a device name as given on the command line or in a config.
pub fn parse_device_kind(s: &str) -> FractResult<DeviceKind> {
    match s {
        "cpu" => Ok(DeviceKind::Cpu),
        #[cfg(feature = "gpu")]
        "gpu" => Ok(DeviceKind::Gpu),
        #[cfg(not(feature = "gpu"))]
        "gpu" => Err(FractError::config(
            "gpu device requested but tilefract was built without the `gpu` feature",
        )),
        other => Err(FractError::config(format!("unknown device '{other}'"))),
    }
}

#[cfg(test)]
#[path = "../../tests/unit/device/backend.rs"]
mod tests;

//! wgpu-backed device.
//!
//! wgpu exposes exactly one queue per device, so both lanes share it ([`LaneTopology::Shared`]).
//! Submissions from the two lanes are still tracked with separate fences and submission indices.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    compute::{
        commands::{Command, CommandBuffer, DispatchSize, PIXEL_BUFFER_BINDING, TileParams},
        fence::Fence,
    },
    device::{
        backend::{
            BufferId, BufferKind, ComputeDevice, DeviceInfo, DeviceKind, DeviceOptions,
            DeviceStats, KernelId, LaneTopology, check_submission,
        },
        kernel::KernelDesc,
    },
    foundation::{
        core::LaneId,
        diagnostics::{DiagnosticSink, Severity, emit},
        error::{FractError, FractResult},
    },
};

/// Uniform slot stride; the WGSL `TileParams` struct is padded to 16 bytes.
const PARAMS_STRIDE: u64 = 256;
const PARAMS_SIZE: u64 = 16;

#[derive(Clone)]
struct GpuBuffer {
    buffer: wgpu::Buffer,
    kind: BufferKind,
    bytes: u64,
}

#[derive(Clone)]
struct GpuKernel {
    desc: Arc<KernelDesc>,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

#[derive(Default)]
struct Counters {
    submissions: AtomicU64,
    command_buffers: AtomicU64,
    dispatches: [AtomicU64; 2],
    invocations: AtomicU64,
    guarded_invocations: AtomicU64,
    copies: AtomicU64,
    validation_findings: AtomicU64,
}

pub struct GpuDevice {
    info: DeviceInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: Mutex<HashMap<BufferId, GpuBuffer>>,
    kernels: Mutex<HashMap<KernelId, GpuKernel>>,
    /// Submission index of the most recent submit guarded by each fence id.
    in_flight: Mutex<HashMap<u64, wgpu::SubmissionIndex>>,
    pending_transfers: Arc<Mutex<HashMap<BufferId, usize>>>,
    next_id: AtomicU32,
    counters: Counters,
    validation_source: String,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl GpuDevice {
    pub fn new(opts: DeviceOptions) -> FractResult<Self> {
        let mut instance_desc = wgpu::InstanceDescriptor::default();
        if opts.validation.enabled {
            instance_desc.flags |= wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::DEBUG;
        }
        let instance = wgpu::Instance::new(&instance_desc);

        let adapters = instance.enumerate_adapters(wgpu::Backends::all());
        for (i, a) in adapters.iter().enumerate() {
            let info = a.get_info();
            tracing::debug!(
                index = i,
                name = %info.name,
                backend = ?info.backend,
                kind = ?info.device_type,
                "gpu adapter"
            );
        }
        let count = adapters.len();
        let adapter = adapters
            .into_iter()
            .nth(opts.device_index)
            .ok_or_else(|| {
                if count == 0 {
                    FractError::device("no gpu adapter available")
                } else {
                    FractError::config(format!(
                        "device_index {} out of range ({count} adapter(s))",
                        opts.device_index
                    ))
                }
            })?;
        let adapter_info = adapter.get_info();

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("tilefract"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| FractError::device(format!("wgpu request_device failed: {e:?}")))?;

        tracing::info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "gpu device ready (lanes share one queue)"
        );
        if opts.validation.enabled {
            emit(
                opts.diagnostics.as_ref(),
                Severity::Info,
                &opts.validation.layer,
                format!("validation enabled on {}", adapter_info.name),
            );
        }

        Ok(Self {
            info: DeviceInfo {
                name: adapter_info.name,
                kind: DeviceKind::Gpu,
                lanes: LaneTopology::Shared,
            },
            device,
            queue,
            buffers: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            pending_transfers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU32::new(1),
            counters: Counters::default(),
            validation_source: opts.validation.layer.clone(),
            diagnostics: opts.diagnostics,
        })
    }

    fn create_buffer(&self, kind: BufferKind, bytes: u64) -> FractResult<BufferId> {
        if bytes == 0 {
            return Err(FractError::device("cannot create a zero-sized buffer"));
        }
        let usage = match kind {
            BufferKind::Storage => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            BufferKind::Staging => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match kind {
                BufferKind::Storage => "tilefract_pixels",
                BufferKind::Staging => "tilefract_staging",
            }),
            size: bytes,
            usage,
            mapped_at_creation: false,
        });
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.buffers)?.insert(
            id,
            GpuBuffer {
                buffer,
                kind,
                bytes,
            },
        );
        tracing::debug!(?id, ?kind, bytes, "created gpu buffer");
        Ok(id)
    }

    fn buffer(&self, id: BufferId) -> FractResult<GpuBuffer> {
        lock(&self.buffers)?
            .get(&id)
            .cloned()
            .ok_or_else(|| FractError::device(format!("unknown buffer {id:?}")))
    }

    fn kernel(&self, id: KernelId) -> FractResult<GpuKernel> {
        lock(&self.kernels)?
            .get(&id)
            .cloned()
            .ok_or_else(|| FractError::device(format!("unknown kernel {id:?}")))
    }

    fn report_validation(&self, err: &wgpu::Error) {
        self.counters
            .validation_findings
            .fetch_add(1, Ordering::Relaxed);
        emit(
            self.diagnostics.as_ref(),
            Severity::Error,
            &self.validation_source,
            err.to_string(),
        );
    }

    /// Translate host command buffers into one wgpu encoder.
    fn encode(&self, lane: LaneId, batch: &[CommandBuffer]) -> FractResult<wgpu::CommandBuffer> {
        let param_slots = batch
            .iter()
            .flat_map(|cb| cb.commands())
            .filter(|c| matches!(c, Command::Dispatch(_)))
            .count() as u64;
        let params_buf = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tilefract_tile_params"),
            size: param_slots.max(1) * PARAMS_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(match lane {
                    LaneId::Zero => "tilefract_lane0",
                    LaneId::One => "tilefract_lane1",
                }),
            });
        let mut bind_groups = HashMap::<(KernelId, BufferId), wgpu::BindGroup>::new();
        let mut slot = 0u64;

        for cb in batch {
            let mut params = TileParams { off_x: 0, off_y: 0 };
            let mut kernel = None;
            let mut target = None;
            for cmd in cb.commands() {
                match cmd {
                    Command::PushParams(p) => params = *p,
                    Command::BindKernel(k) => kernel = Some(*k),
                    Command::BindStorage { binding, buffer } if *binding == PIXEL_BUFFER_BINDING => {
                        target = Some(*buffer)
                    }
                    Command::BindStorage { binding, .. } => {
                        return Err(FractError::device(format!(
                            "binding {binding} is not part of the kernel layout"
                        )));
                    }
                    Command::Dispatch(size) => {
                        let (Some(kid), Some(bid)) = (kernel, target) else {
                            return Err(FractError::device(format!(
                                "{:?} dispatches without kernel and pixel buffer",
                                cb.id()
                            )));
                        };
                        let k = self.kernel(kid)?;
                        if !bind_groups.contains_key(&(kid, bid)) {
                            let storage = self.buffer(bid)?;
                            if storage.kind != BufferKind::Storage {
                                return Err(FractError::device(format!(
                                    "dispatch target {bid:?} is not a storage buffer"
                                )));
                            }
                            let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                                label: Some("tilefract_bind_group"),
                                layout: &k.layout,
                                entries: &[
                                    wgpu::BindGroupEntry {
                                        binding: PIXEL_BUFFER_BINDING,
                                        resource: storage.buffer.as_entire_binding(),
                                    },
                                    wgpu::BindGroupEntry {
                                        binding: 1,
                                        resource: wgpu::BindingResource::Buffer(
                                            wgpu::BufferBinding {
                                                buffer: &params_buf,
                                                offset: 0,
                                                size: wgpu::BufferSize::new(PARAMS_SIZE),
                                            },
                                        ),
                                    },
                                ],
                            });
                            bind_groups.insert((kid, bid), bg);
                        }
                        let Some(bg) = bind_groups.get(&(kid, bid)) else {
                            return Err(FractError::device("bind group cache miss"));
                        };

                        let offset = slot * PARAMS_STRIDE;
                        let mut block = [0u8; PARAMS_SIZE as usize];
                        block[..TileParams::BYTES].copy_from_slice(&params.to_le_bytes());
                        self.queue.write_buffer(&params_buf, offset, &block);
                        slot += 1;

                        {
                            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                                label: Some("tilefract_tile"),
                                timestamp_writes: None,
                            });
                            pass.set_pipeline(&k.pipeline);
                            pass.set_bind_group(0, bg, &[offset as u32]);
                            pass.dispatch_workgroups(size.x, size.y, size.z);
                        }
                        self.count_dispatch(lane, &k.desc, params, *size);
                    }
                    Command::CopyBuffer { src, dst, bytes } => {
                        let from = self.buffer(*src)?;
                        let to = self.buffer(*dst)?;
                        if *bytes > from.bytes || *bytes > to.bytes {
                            return Err(FractError::device(format!(
                                "copy of {bytes} bytes exceeds {src:?} or {dst:?}"
                            )));
                        }
                        encoder.copy_buffer_to_buffer(&from.buffer, 0, &to.buffer, 0, *bytes);
                        self.counters.copies.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(encoder.finish())
    }

    /// Guard counts follow from the dispatch shape; the device does not report them.
    fn count_dispatch(
        &self,
        lane: LaneId,
        desc: &KernelDesc,
        params: TileParams,
        size: DispatchSize,
    ) {
        let g = u64::from(desc.group_size);
        let total = size.groups() * g * g;
        let w = u64::from(desc.tile.width.min(desc.canvas.width.saturating_sub(params.off_x)));
        let h = u64::from(desc.tile.height.min(desc.canvas.height.saturating_sub(params.off_y)));
        let written = (w.min(u64::from(size.x) * g)) * (h.min(u64::from(size.y) * g));
        let c = &self.counters;
        c.dispatches[lane.index()].fetch_add(1, Ordering::Relaxed);
        c.invocations.fetch_add(written, Ordering::Relaxed);
        c.guarded_invocations
            .fetch_add(total.saturating_sub(written), Ordering::Relaxed);
    }
}

impl ComputeDevice for GpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_storage_buffer(&self, bytes: u64) -> FractResult<BufferId> {
        self.create_buffer(BufferKind::Storage, bytes)
    }

    fn create_staging_buffer(&self, bytes: u64) -> FractResult<BufferId> {
        self.create_buffer(BufferKind::Staging, bytes)
    }

    fn destroy_buffer(&self, id: BufferId) -> FractResult<()> {
        let buf = lock(&self.buffers)?
            .remove(&id)
            .ok_or_else(|| FractError::device(format!("destroy of unknown buffer {id:?}")))?;
        buf.buffer.destroy();
        Ok(())
    }

    fn create_kernel(&self, desc: &KernelDesc) -> FractResult<KernelId> {
        desc.spec.validate()?;
        let limits = self.device.limits();
        let invocations = desc.group_size.saturating_mul(desc.group_size);
        if desc.group_size == 0
            || desc.group_size > limits.max_compute_workgroup_size_x
            || desc.group_size > limits.max_compute_workgroup_size_y
            || invocations > limits.max_compute_invocations_per_workgroup
        {
            return Err(FractError::config(format!(
                "group size {} is not supported by this adapter (max {} invocations)",
                desc.group_size, limits.max_compute_invocations_per_workgroup
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let source = desc.spec.wgsl_source();
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.spec.name()),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
            });
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("tilefract_layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: PIXEL_BUFFER_BINDING,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: false },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: true,
                            min_binding_size: wgpu::BufferSize::new(PARAMS_SIZE),
                        },
                        count: None,
                    },
                ],
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("tilefract_pipeline_layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let constants = desc.spec.override_constants(desc);
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(desc.spec.name()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    zero_initialize_workgroup_memory: false,
                },
                cache: None,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            self.report_validation(&err);
            return Err(FractError::device(format!(
                "kernel '{}' failed to build: {err}",
                desc.spec.name()
            )));
        }

        let id = KernelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.kernels)?.insert(
            id,
            GpuKernel {
                desc: Arc::new(desc.clone()),
                pipeline,
                layout,
            },
        );
        tracing::debug!(?id, kernel = desc.spec.name(), "created gpu kernel");
        Ok(id)
    }

    fn destroy_kernel(&self, id: KernelId) -> FractResult<()> {
        lock(&self.kernels)?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| FractError::device(format!("destroy of unknown kernel {id:?}")))
    }

    fn submit(&self, lane: LaneId, batch: Vec<CommandBuffer>, fence: &Fence) -> FractResult<()> {
        check_submission(lane, &batch, fence)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let encoded = self.encode(lane, &batch);
        let encoded = match encoded {
            Ok(cmd) => cmd,
            Err(e) => {
                let _ = pollster::block_on(self.device.pop_error_scope());
                return Err(e);
            }
        };

        let copies: Vec<BufferId> = batch
            .iter()
            .flat_map(|cb| cb.commands())
            .filter_map(|c| match c {
                Command::CopyBuffer { dst, .. } => Some(*dst),
                _ => None,
            })
            .collect();
        {
            let mut pending = lock(&self.pending_transfers)?;
            for dst in &copies {
                *pending.entry(*dst).or_default() += 1;
            }
        }

        let index = self.queue.submit(Some(encoded));
        let signal = fence.clone();
        let pending = Arc::clone(&self.pending_transfers);
        self.queue.on_submitted_work_done(move || {
            if let Ok(mut pending) = pending.lock() {
                for dst in &copies {
                    if let Some(n) = pending.get_mut(dst) {
                        *n = n.saturating_sub(1);
                        if *n == 0 {
                            pending.remove(dst);
                        }
                    }
                }
            }
            signal.signal();
        });
        lock(&self.in_flight)?.insert(fence.id(), index);

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            self.report_validation(&err);
            fence.mark_lost(err.to_string());
            return Err(FractError::device(format!("{lane} submission rejected: {err}")));
        }

        let c = &self.counters;
        c.submissions.fetch_add(1, Ordering::Relaxed);
        c.command_buffers
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn wait_for_fences(&self, fences: &[&Fence], timeout: Duration) -> FractResult<()> {
        let deadline = Instant::now() + timeout;
        for fence in fences {
            let index = lock(&self.in_flight)?.get(&fence.id()).cloned();
            if let Some(index) = index {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.device
                    .poll(wgpu::PollType::Wait {
                        submission_index: Some(index),
                        timeout: Some(remaining),
                    })
                    .map_err(|e| match e {
                        wgpu::PollError::Timeout => FractError::timeout(format!(
                            "fence {} not signaled within {timeout:?}",
                            fence.id()
                        )),
                        other => FractError::device(format!("wgpu poll failed: {other}")),
                    })?;
            }
            fence.wait_until(deadline)?;
            lock(&self.in_flight)?.remove(&fence.id());
        }
        Ok(())
    }

    fn map_read(
        &self,
        buffer: BufferId,
        offset: u64,
        len: u64,
        read: &mut dyn FnMut(&[u8]),
    ) -> FractResult<()> {
        let buf = self.buffer(buffer)?;
        if buf.kind != BufferKind::Staging {
            return Err(FractError::device(format!(
                "buffer {buffer:?} is not host visible; copy it to a staging buffer first"
            )));
        }
        if lock(&self.pending_transfers)?.contains_key(&buffer) {
            return Err(FractError::device(format!(
                "buffer {buffer:?} has a transfer in flight; wait on its fence first"
            )));
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= buf.bytes)
            .ok_or_else(|| {
                FractError::device(format!(
                    "map of {len} bytes at {offset} exceeds buffer {buffer:?} ({} bytes)",
                    buf.bytes
                ))
            })?;

        let slice = buf.buffer.slice(offset..end);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| FractError::device(format!("wgpu poll failed: {e:?}")))?;
        rx.recv()
            .map_err(|_| FractError::device("map channel closed"))?
            .map_err(|e| FractError::device(format!("map failed: {e:?}")))?;

        let mapped = slice.get_mapped_range();
        read(&mapped[..]);
        drop(mapped);
        buf.buffer.unmap();
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        let c = &self.counters;
        DeviceStats {
            submissions: c.submissions.load(Ordering::Relaxed),
            command_buffers: c.command_buffers.load(Ordering::Relaxed),
            dispatches: [
                c.dispatches[0].load(Ordering::Relaxed),
                c.dispatches[1].load(Ordering::Relaxed),
            ],
            invocations: c.invocations.load(Ordering::Relaxed),
            guarded_invocations: c.guarded_invocations.load(Ordering::Relaxed),
            copies: c.copies.load(Ordering::Relaxed),
            validation_findings: c.validation_findings.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> FractResult<std::sync::MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| FractError::device("gpu device lock poisoned"))
}

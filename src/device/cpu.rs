//! Software reference device.
//!
//! Each lane is a worker thread draining its own FIFO queue, so lane 0 and lane 1 really do execute
//! concurrently. Device memory is a vector of atomic words; tiles never overlap, so plain relaxed
//! stores are enough and the fence's mutex orders them before any host read.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::Duration,
};

use rayon::prelude::*;

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
        core::{LaneId, Pixel},
        diagnostics::{DiagnosticSink, Severity, emit},
        error::{FractError, FractResult},
    },
};

const VALIDATION_SOURCE: &str = "cpu-validation";
const WORDS_PER_PIXEL: usize = Pixel::BYTES / 4;

struct CpuBuffer {
    kind: BufferKind,
    bytes: u64,
    words: Vec<AtomicU32>,
    /// Per-pixel writer tag (0 = unwritten, lane index + 1 otherwise). Storage buffers only,
    /// and only with validation enabled.
    owners: Option<Vec<AtomicU8>>,
}

impl CpuBuffer {
    fn new(kind: BufferKind, bytes: u64, track_owners: bool) -> Self {
        let word_count = bytes.div_ceil(4) as usize;
        let words = (0..word_count).map(|_| AtomicU32::new(0)).collect();
        let owners = (track_owners && kind == BufferKind::Storage).then(|| {
            (0..(bytes as usize / Pixel::BYTES))
                .map(|_| AtomicU8::new(0))
                .collect()
        });
        Self {
            kind,
            bytes,
            words,
            owners,
        }
    }
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

struct Shared {
    buffers: RwLock<HashMap<BufferId, Arc<CpuBuffer>>>,
    kernels: RwLock<HashMap<KernelId, Arc<KernelDesc>>>,
    /// Staging buffers with copies queued but not yet executed.
    pending_transfers: Mutex<HashMap<BufferId, usize>>,
    next_id: AtomicU32,
    counters: Counters,
    validation: bool,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
    dispatch_delay: Option<Duration>,
    pool: rayon::ThreadPool,
}

struct Job {
    batch: Vec<CommandBuffer>,
    fence: Fence,
}

struct LaneQueue {
    tx: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

pub struct CpuDevice {
    info: DeviceInfo,
    shared: Arc<Shared>,
    lanes: [LaneQueue; 2],
}

impl CpuDevice {
    pub fn new(opts: DeviceOptions) -> FractResult<Self> {
        let shared = Arc::new(Shared {
            buffers: RwLock::new(HashMap::new()),
            kernels: RwLock::new(HashMap::new()),
            pending_transfers: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            counters: Counters::default(),
            validation: opts.validation.enabled,
            diagnostics: opts.diagnostics.clone(),
            dispatch_delay: opts.cpu.dispatch_delay,
            pool: build_thread_pool(opts.cpu.threads)?,
        });
        let lanes = [
            spawn_lane(LaneId::Zero, Arc::clone(&shared))?,
            spawn_lane(LaneId::One, Arc::clone(&shared))?,
        ];
        if shared.validation {
            emit(
                shared.diagnostics.as_ref(),
                Severity::Info,
                VALIDATION_SOURCE,
                "write-ownership validation enabled",
            );
        }
        Ok(Self {
            info: DeviceInfo {
                name: "tilefract software device".to_string(),
                kind: DeviceKind::Cpu,
                lanes: LaneTopology::Independent,
            },
            shared,
            lanes,
        })
    }

    fn create_buffer(&self, kind: BufferKind, bytes: u64) -> FractResult<BufferId> {
        if bytes == 0 {
            return Err(FractError::device("cannot create a zero-sized buffer"));
        }
        if usize::try_from(bytes).is_err() {
            return Err(FractError::device(format!(
                "buffer of {bytes} bytes exceeds host address space"
            )));
        }
        let id = BufferId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let buf = CpuBuffer::new(kind, bytes, self.shared.validation);
        self.shared
            .buffers
            .write()
            .map_err(|_| poisoned("buffer table"))?
            .insert(id, Arc::new(buf));
        tracing::debug!(?id, ?kind, bytes, "created buffer");
        Ok(id)
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        for lane in &mut self.lanes {
            // Closing the channel lets the worker drain and exit.
            lane.tx.take();
            if let Some(worker) = lane.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

impl ComputeDevice for CpuDevice {
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
        self.shared
            .buffers
            .write()
            .map_err(|_| poisoned("buffer table"))?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| FractError::device(format!("destroy of unknown buffer {id:?}")))
    }

    fn create_kernel(&self, desc: &KernelDesc) -> FractResult<KernelId> {
        desc.spec.validate()?;
        if desc.group_size == 0 {
            return Err(FractError::device("kernel group size must be >= 1"));
        }
        let id = KernelId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .kernels
            .write()
            .map_err(|_| poisoned("kernel table"))?
            .insert(id, Arc::new(desc.clone()));
        tracing::debug!(?id, kernel = desc.spec.name(), "created kernel");
        Ok(id)
    }

    fn destroy_kernel(&self, id: KernelId) -> FractResult<()> {
        self.shared
            .kernels
            .write()
            .map_err(|_| poisoned("kernel table"))?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| FractError::device(format!("destroy of unknown kernel {id:?}")))
    }

    fn submit(&self, lane: LaneId, batch: Vec<CommandBuffer>, fence: &Fence) -> FractResult<()> {
        check_submission(lane, &batch, fence)?;
        let tx = self.lanes[lane.index()]
            .tx
            .as_ref()
            .ok_or_else(|| FractError::device(format!("{lane} queue is shut down")))?;

        let copies = copy_targets(&batch);
        if !copies.is_empty() {
            let mut pending = self
                .shared
                .pending_transfers
                .lock()
                .map_err(|_| poisoned("transfer table"))?;
            for dst in &copies {
                *pending.entry(*dst).or_default() += 1;
            }
        }

        let c = &self.shared.counters;
        c.submissions.fetch_add(1, Ordering::Relaxed);
        c.command_buffers
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        let job = Job {
            batch,
            fence: fence.clone(),
        };
        if tx.send(job).is_err() {
            self.shared.release_transfers(&copies);
            return Err(FractError::device(format!("{lane} worker has stopped")));
        }
        Ok(())
    }

    fn wait_for_fences(&self, fences: &[&Fence], timeout: Duration) -> FractResult<()> {
        let deadline = std::time::Instant::now() + timeout;
        for fence in fences {
            fence.wait_until(deadline)?;
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
        let buf = self.shared.buffer(buffer)?;
        if buf.kind != BufferKind::Staging {
            return Err(FractError::device(format!(
                "buffer {buffer:?} is not host visible; copy it to a staging buffer first"
            )));
        }
        let in_flight = self
            .shared
            .pending_transfers
            .lock()
            .map_err(|_| poisoned("transfer table"))?
            .get(&buffer)
            .copied()
            .unwrap_or(0);
        if in_flight > 0 {
            return Err(FractError::device(format!(
                "buffer {buffer:?} has {in_flight} transfer(s) in flight; wait on their fence first"
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
        if offset % 4 != 0 || len % 4 != 0 {
            return Err(FractError::device("map range must be 4-byte aligned"));
        }
        let mut bytes = Vec::with_capacity(len as usize);
        for w in &buf.words[(offset / 4) as usize..(end / 4) as usize] {
            bytes.extend_from_slice(&w.load(Ordering::Relaxed).to_le_bytes());
        }
        read(&bytes);
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        let c = &self.shared.counters;
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

fn spawn_lane(lane: LaneId, shared: Arc<Shared>) -> FractResult<LaneQueue> {
    let (tx, rx) = mpsc::channel::<Job>();
    let worker = std::thread::Builder::new()
        .name(format!("tilefract-{lane}"))
        .spawn(move || {
            for job in rx {
                let copies = copy_targets(&job.batch);
                let res = job
                    .batch
                    .iter()
                    .try_for_each(|cb| shared.execute(lane, cb));
                shared.release_transfers(&copies);
                match res {
                    Ok(()) => job.fence.signal(),
                    Err(e) => {
                        tracing::error!(
                            %lane,
                            fence = job.fence.id(),
                            error = %e,
                            "lane execution failed"
                        );
                        job.fence.mark_lost(e.to_string());
                    }
                }
            }
            tracing::trace!(%lane, "lane worker exiting");
        })
        .map_err(|e| FractError::device(format!("failed to spawn {lane} worker: {e}")))?;
    Ok(LaneQueue {
        tx: Some(tx),
        worker: Some(worker),
    })
}

fn copy_targets(batch: &[CommandBuffer]) -> Vec<BufferId> {
    batch
        .iter()
        .flat_map(|cb| cb.commands())
        .filter_map(|cmd| match cmd {
            Command::CopyBuffer { dst, .. } => Some(*dst),
            _ => None,
        })
        .collect()
}

impl Shared {
    fn buffer(&self, id: BufferId) -> FractResult<Arc<CpuBuffer>> {
        self.buffers
            .read()
            .map_err(|_| poisoned("buffer table"))?
            .get(&id)
            .cloned()
            .ok_or_else(|| FractError::device(format!("unknown buffer {id:?}")))
    }

    fn kernel(&self, id: KernelId) -> FractResult<Arc<KernelDesc>> {
        self.kernels
            .read()
            .map_err(|_| poisoned("kernel table"))?
            .get(&id)
            .cloned()
            .ok_or_else(|| FractError::device(format!("unknown kernel {id:?}")))
    }

    fn release_transfers(&self, copies: &[BufferId]) {
        if copies.is_empty() {
            return;
        }
        if let Ok(mut pending) = self.pending_transfers.lock() {
            for dst in copies {
                if let Some(n) = pending.get_mut(dst) {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        pending.remove(dst);
                    }
                }
            }
        }
    }

    fn execute(&self, lane: LaneId, cb: &CommandBuffer) -> FractResult<()> {
        let mut params = None;
        let mut kernel = None;
        let mut bindings = HashMap::<u32, BufferId>::new();
        for cmd in cb.commands() {
            match cmd {
                Command::PushParams(p) => params = Some(*p),
                Command::BindKernel(k) => kernel = Some(*k),
                Command::BindStorage { binding, buffer } => {
                    bindings.insert(*binding, *buffer);
                }
                Command::Dispatch(size) => {
                    let kernel = kernel.ok_or_else(|| {
                        FractError::device(format!("{:?} dispatches with no kernel", cb.id()))
                    })?;
                    let target = bindings.get(&PIXEL_BUFFER_BINDING).copied().ok_or_else(|| {
                        FractError::device(format!("{:?} dispatches with no pixel buffer", cb.id()))
                    })?;
                    let params = params.unwrap_or(TileParams { off_x: 0, off_y: 0 });
                    self.dispatch(lane, kernel, target, params, *size)?;
                }
                Command::CopyBuffer { src, dst, bytes } => self.copy(*src, *dst, *bytes)?,
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        lane: LaneId,
        kernel: KernelId,
        target: BufferId,
        params: TileParams,
        size: DispatchSize,
    ) -> FractResult<()> {
        if let Some(delay) = self.dispatch_delay {
            std::thread::sleep(delay);
        }
        let desc = self.kernel(kernel)?;
        let buf = self.buffer(target)?;
        if buf.kind != BufferKind::Storage {
            return Err(FractError::device(format!(
                "dispatch target {target:?} is not a storage buffer"
            )));
        }
        let canvas = desc.canvas;
        if buf.bytes < canvas.pixel_buffer_bytes()? {
            return Err(FractError::device(format!(
                "buffer {target:?} holds {} bytes but the kernel addresses {} pixels",
                buf.bytes,
                canvas.pixel_count()
            )));
        }

        let group = desc.group_size;
        let extent_x = size.x.saturating_mul(group);
        let extent_y = size.y.saturating_mul(group);
        let lane_tag = lane.index() as u8 + 1;
        let tile = desc.tile;

        // Rows of invocations run in parallel; every invocation outside the tile or the canvas
        // is guarded and writes nothing.
        let (written, guarded, findings) = self.pool.install(|| {
            (0..extent_y)
                .into_par_iter()
                .map(|gy| {
                    let mut written = 0u64;
                    let mut guarded = 0u64;
                    let mut findings = 0u64;
                    for gx in 0..extent_x {
                        let x = params.off_x + gx;
                        let y = params.off_y + gy;
                        if gx >= tile.width
                            || gy >= tile.height
                            || x >= canvas.width
                            || y >= canvas.height
                        {
                            guarded += 1;
                            continue;
                        }
                        let idx = y as usize * canvas.width as usize + x as usize;
                        let px = desc.spec.shade(canvas, x, y);
                        let base = idx * WORDS_PER_PIXEL;
                        for (i, ch) in px.channels().into_iter().enumerate() {
                            buf.words[base + i].store(ch.to_bits(), Ordering::Relaxed);
                        }
                        if let Some(owners) = &buf.owners
                            && owners[idx].swap(lane_tag, Ordering::Relaxed) != 0
                        {
                            findings += 1;
                        }
                        written += 1;
                    }
                    (written, guarded, findings)
                })
                .reduce(|| (0, 0, 0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2))
        });

        let c = &self.counters;
        c.dispatches[lane.index()].fetch_add(1, Ordering::Relaxed);
        c.invocations.fetch_add(written, Ordering::Relaxed);
        c.guarded_invocations.fetch_add(guarded, Ordering::Relaxed);
        if findings > 0 {
            c.validation_findings.fetch_add(findings, Ordering::Relaxed);
            emit(
                self.diagnostics.as_ref(),
                Severity::Error,
                VALIDATION_SOURCE,
                format!(
                    "{lane} dispatch at ({}, {}) overwrote {findings} pixel(s) already written",
                    params.off_x, params.off_y
                ),
            );
        }
        Ok(())
    }

    fn copy(&self, src: BufferId, dst: BufferId, bytes: u64) -> FractResult<()> {
        let from = self.buffer(src)?;
        let to = self.buffer(dst)?;
        if bytes > from.bytes || bytes > to.bytes {
            return Err(FractError::device(format!(
                "copy of {bytes} bytes exceeds {src:?} ({}) or {dst:?} ({})",
                from.bytes, to.bytes
            )));
        }
        let words = bytes.div_ceil(4) as usize;
        for (d, s) in to.words[..words].iter().zip(&from.words[..words]) {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.counters.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn build_thread_pool(threads: Option<usize>) -> FractResult<rayon::ThreadPool> {
    if let Some(n) = threads
        && n == 0
    {
        return Err(FractError::config("cpu device 'threads' must be >= 1 when set"));
    }

    let mut builder =
        rayon::ThreadPoolBuilder::new().thread_name(|i| format!("tilefract-rows-{i}"));
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    builder
        .build()
        .map_err(|e| FractError::device(format!("failed to build rayon thread pool: {e}")))
}

fn poisoned(what: &str) -> FractError {
    FractError::device(format!("{what} lock poisoned"))
}

#[cfg(test)]
#[path = "../../tests/unit/device/cpu.rs"]
mod tests;

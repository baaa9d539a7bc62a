use std::{
    sync::mpsc,
    time::{Duration, Instant},
};

use crate::{
    compute::{commands::CommandBuffer, fence::Fence},
    device::backend::ComputeDevice,
    foundation::{
        config::{SubmitConfig, SubmitMode},
        core::LaneId,
        error::{FractError, FractResult},
    },
};

/// One completed submit → wait → reset cycle on a lane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IterationRecord {
    pub iteration: u32,
    pub command_buffers: usize,
    /// Tile indices in submission order.
    pub tiles: Vec<usize>,
    pub elapsed: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitReport {
    pub mode: SubmitMode,
    pub lanes: [Vec<IterationRecord>; 2],
}

impl SubmitReport {
    pub fn lane(&self, lane: LaneId) -> &[IterationRecord] {
        &self.lanes[lane.index()]
    }

    /// Every tile index submitted on `lane`, in order.
    pub fn submitted_tiles(&self, lane: LaneId) -> Vec<usize> {
        self.lane(lane)
            .iter()
            .flat_map(|r| r.tiles.iter().copied())
            .collect()
    }
}

/// A unit of work handed to a lane: one sub-batch of its recorded buffers.
#[derive(Debug)]
struct LaneTask {
    iteration: u32,
    buffers: Vec<CommandBuffer>,
}

/// Split a lane's buffers into at most `iterations` ordered sub-batches of `ceil(len / iterations)`.
fn split_into_tasks(buffers: Vec<CommandBuffer>, iterations: u32) -> Vec<LaneTask> {
    if buffers.is_empty() {
        return Vec::new();
    }
    let per_task = buffers.len().div_ceil(iterations.max(1) as usize);
    let mut tasks = Vec::new();
    let mut rest = buffers.into_iter().peekable();
    let mut iteration = 0;
    while rest.peek().is_some() {
        let chunk: Vec<CommandBuffer> = rest.by_ref().take(per_task).collect();
        tasks.push(LaneTask {
            iteration,
            buffers: chunk,
        });
        iteration += 1;
    }
    tasks
}

/// Submits both lanes' recorded work and blocks until the device has finished it.
pub struct QueueSubmitter<'d> {
    device: &'d dyn ComputeDevice,
    config: SubmitConfig,
    timeout: Duration,
}

impl<'d> QueueSubmitter<'d> {
    pub fn new(device: &'d dyn ComputeDevice, config: SubmitConfig, timeout: Duration) -> Self {
        Self {
            device,
            config,
            timeout,
        }
    }

    /// Run every buffer of both lanes to completion. Within a lane, buffers execute in the order
    /// given; the lanes are not ordered with respect to each other.
    #[tracing::instrument(
        skip(self, lanes),
        fields(mode = ?self.config.mode, iterations = self.config.iterations)
    )]
    pub fn submit(&self, lanes: [Vec<CommandBuffer>; 2]) -> FractResult<SubmitReport> {
        let [l0, l1] = lanes;
        let tasks = [
            split_into_tasks(l0, self.config.iterations),
            split_into_tasks(l1, self.config.iterations),
        ];
        let lanes = match self.config.mode {
            SubmitMode::Joint => self.run_joint(tasks)?,
            SubmitMode::Threaded => self.run_threaded(tasks)?,
        };
        Ok(SubmitReport {
            mode: self.config.mode,
            lanes,
        })
    }

    /// Lane 0 then lane 1 from this thread, then one wait on both fences, per iteration.
    fn run_joint(&self, tasks: [Vec<LaneTask>; 2]) -> FractResult<[Vec<IterationRecord>; 2]> {
        let fences = [Fence::new(), Fence::new()];
        let mut records: [Vec<IterationRecord>; 2] = [Vec::new(), Vec::new()];
        let [t0, t1] = tasks;
        let mut queues = [t0.into_iter(), t1.into_iter()];

        loop {
            let started = Instant::now();
            let mut pending = Vec::with_capacity(2);
            for lane in LaneId::ALL {
                let Some(task) = queues[lane.index()].next() else {
                    continue;
                };
                let record = describe(&task);
                tracing::debug!(
                    %lane,
                    iteration = task.iteration,
                    buffers = task.buffers.len(),
                    "submit"
                );
                self.device
                    .submit(lane, task.buffers, &fences[lane.index()])?;
                pending.push((lane, record));
            }
            if pending.is_empty() {
                break;
            }

            let waiting: Vec<&Fence> = pending
                .iter()
                .map(|(lane, _)| &fences[lane.index()])
                .collect();
            self.device
                .wait_for_fences(&waiting, self.timeout)
                .inspect_err(|e| log_hang(None, e))?;

            let elapsed = started.elapsed();
            for (lane, mut record) in pending {
                fences[lane.index()].reset()?;
                record.elapsed = elapsed;
                records[lane.index()].push(record);
            }
        }
        Ok(records)
    }

    /// One worker per lane, fed through its own channel; the caller joins both.
    fn run_threaded(&self, tasks: [Vec<LaneTask>; 2]) -> FractResult<[Vec<IterationRecord>; 2]> {
        let device = self.device;
        let timeout = self.timeout;
        let [t0, t1] = tasks;

        std::thread::scope(|scope| {
            let mut workers = Vec::with_capacity(2);
            for (lane, lane_tasks) in LaneId::ALL.into_iter().zip([t0, t1]) {
                let (tx, rx) = mpsc::channel::<LaneTask>();
                let worker = std::thread::Builder::new()
                    .name(format!("tilefract-submit-{lane}"))
                    .spawn_scoped(scope, move || lane_worker(device, lane, rx, timeout))
                    .map_err(|e| {
                        FractError::device(format!("failed to spawn {lane} submitter: {e}"))
                    })?;
                for task in lane_tasks {
                    // A closed channel means the worker already failed; its result carries the error.
                    if tx.send(task).is_err() {
                        break;
                    }
                }
                workers.push((lane, worker));
            }

            let mut records: [Vec<IterationRecord>; 2] = [Vec::new(), Vec::new()];
            let mut first_err = None;
            for (lane, worker) in workers {
                let res = worker
                    .join()
                    .map_err(|_| FractError::device(format!("{lane} submitter panicked")))
                    .and_then(|r| r);
                match res {
                    Ok(r) => records[lane.index()] = r,
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok(records),
            }
        })
    }
}

fn lane_worker(
    device: &dyn ComputeDevice,
    lane: LaneId,
    rx: mpsc::Receiver<LaneTask>,
    timeout: Duration,
) -> FractResult<Vec<IterationRecord>> {
    let fence = Fence::new();
    let mut records = Vec::new();
    for task in rx {
        let started = Instant::now();
        let mut record = describe(&task);
        tracing::debug!(
            %lane,
            iteration = task.iteration,
            buffers = task.buffers.len(),
            "submit"
        );
        device.submit(lane, task.buffers, &fence)?;
        device
            .wait_for_fences(&[&fence], timeout)
            .inspect_err(|e| log_hang(Some(lane), e))?;
        fence.reset()?;
        record.elapsed = started.elapsed();
        tracing::trace!(
            %lane,
            iteration = record.iteration,
            elapsed = ?record.elapsed,
            "lane progress"
        );
        records.push(record);
    }
    Ok(records)
}

fn describe(task: &LaneTask) -> IterationRecord {
    IterationRecord {
        iteration: task.iteration,
        command_buffers: task.buffers.len(),
        tiles: task.buffers.iter().filter_map(|cb| cb.tile()).collect(),
        elapsed: Duration::ZERO,
    }
}

fn log_hang(lane: Option<LaneId>, err: &FractError) {
    if matches!(err, FractError::Timeout(_)) {
        match lane {
            Some(lane) => {
                tracing::error!(%lane, error = %err, "device hung: fence wait timed out")
            }
            None => tracing::error!(error = %err, "device hung: fence wait timed out"),
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/compute/submit.rs"]
mod tests;

use super::*;
use crate::{
    compute::{
        commands::CommandPool,
        recorder::{CommandBuilder, record_copy},
        scheduler::TileScheduler,
    },
    device::{backend::CpuDeviceOptions, kernel::KernelSpec},
    foundation::{
        config::{DispatchRounding, ValidationConfig},
        core::{Canvas, TileSize},
        diagnostics::CollectingSink,
    },
};

const WAIT: Duration = Duration::from_secs(30);

fn desc(canvas: Canvas) -> KernelDesc {
    KernelDesc {
        spec: KernelSpec::Gradient,
        canvas,
        tile: TileSize::square(32),
        group_size: 16,
    }
}

fn device(opts: DeviceOptions) -> CpuDevice {
    CpuDevice::new(opts).unwrap()
}

fn read_all(dev: &CpuDevice, buf: BufferId, bytes: u64) -> Vec<u8> {
    let mut out = Vec::new();
    dev.map_read(buf, 0, bytes, &mut |b| out.extend_from_slice(b))
        .unwrap();
    out
}

#[test]
fn renders_every_tile_through_both_lanes_and_copies_to_staging() {
    let canvas = Canvas {
        width: 64,
        height: 64,
    };
    let dev = device(DeviceOptions::default());
    let bytes = canvas.pixel_buffer_bytes().unwrap();
    let storage = dev.create_storage_buffer(bytes).unwrap();
    let staging = dev.create_staging_buffer(bytes).unwrap();
    let kernel = dev.create_kernel(&desc(canvas)).unwrap();
    let builder = CommandBuilder::new(kernel, storage, 16, DispatchRounding::Ceil).unwrap();
    let sched = TileScheduler::new(canvas, TileSize::square(32))
        .unwrap()
        .schedule();

    let fences = [Fence::new(), Fence::new()];
    for lane in LaneId::ALL {
        let mut pool = CommandPool::new(lane);
        let batch = builder.record_lane(&mut pool, sched.lane(lane)).unwrap();
        dev.submit(lane, batch, &fences[lane.index()]).unwrap();
    }
    dev.wait_for_fences(&[&fences[0], &fences[1]], WAIT).unwrap();

    let fence = Fence::new();
    let mut pool = CommandPool::new(LaneId::Zero);
    let copy = record_copy(&mut pool, storage, staging, bytes).unwrap();
    dev.submit(LaneId::Zero, vec![copy], &fence).unwrap();
    dev.wait_for_fences(&[&fence], WAIT).unwrap();

    let data = read_all(&dev, staging, bytes);
    for y in 0..canvas.height {
        for x in 0..canvas.width {
            let i = (y * canvas.width + x) as usize * Pixel::BYTES;
            let px = Pixel::from_le_bytes(&data[i..i + Pixel::BYTES]).unwrap();
            assert_eq!(px, KernelSpec::Gradient.shade(canvas, x, y), "pixel ({x}, {y})");
        }
    }

    let stats = dev.stats();
    assert_eq!(stats.dispatches, [2, 2]);
    assert_eq!(stats.invocations, canvas.pixel_count());
    assert_eq!(stats.guarded_invocations, 0);
    assert_eq!(stats.copies, 1);
    assert_eq!(stats.submissions, 3);
}

#[test]
fn legacy_rounding_guards_the_extra_row_of_groups() {
    let canvas = Canvas {
        width: 32,
        height: 32,
    };
    let dev = device(DeviceOptions::default());
    let storage = dev
        .create_storage_buffer(canvas.pixel_buffer_bytes().unwrap())
        .unwrap();
    let kernel = dev.create_kernel(&desc(canvas)).unwrap();
    let builder =
        CommandBuilder::new(kernel, storage, 16, DispatchRounding::LegacyOverflow).unwrap();
    let sched = TileScheduler::new(canvas, TileSize::square(32))
        .unwrap()
        .schedule();
    let mut pool = CommandPool::new(LaneId::Zero);
    let batch = builder
        .record_lane(&mut pool, sched.lane(LaneId::Zero))
        .unwrap();
    let fence = Fence::new();
    dev.submit(LaneId::Zero, batch, &fence).unwrap();
    dev.wait_for_fences(&[&fence], WAIT).unwrap();

    let stats = dev.stats();
    assert_eq!(stats.invocations, 32 * 32);
    // 2 x 3 groups of 16 x 16: one extra row of groups, all guarded.
    assert_eq!(stats.guarded_invocations, 2 * 16 * 16);
}

#[test]
fn storage_buffers_are_not_host_visible() {
    let dev = device(DeviceOptions::default());
    let storage = dev.create_storage_buffer(64).unwrap();
    let err = dev.map_read(storage, 0, 64, &mut |_| {}).unwrap_err();
    assert!(matches!(err, FractError::Device(_)));
}

#[test]
fn map_read_rejects_out_of_range() {
    let dev = device(DeviceOptions::default());
    let staging = dev.create_staging_buffer(64).unwrap();
    assert!(dev.map_read(staging, 32, 64, &mut |_| {}).is_err());
    dev.map_read(staging, 32, 32, &mut |b| assert_eq!(b.len(), 32))
        .unwrap();
}

#[test]
fn overlapping_writes_are_reported_when_validation_is_enabled() {
    let canvas = Canvas {
        width: 32,
        height: 32,
    };
    let sink = CollectingSink::new();
    let dev = device(DeviceOptions {
        validation: ValidationConfig {
            enabled: true,
            ..ValidationConfig::default()
        },
        diagnostics: Some(sink.clone()),
        ..DeviceOptions::default()
    });
    let storage = dev
        .create_storage_buffer(canvas.pixel_buffer_bytes().unwrap())
        .unwrap();
    let kernel = dev.create_kernel(&desc(canvas)).unwrap();
    let builder = CommandBuilder::new(kernel, storage, 16, DispatchRounding::Ceil).unwrap();
    let tile = TileScheduler::new(canvas, TileSize::square(32))
        .unwrap()
        .grid()
        .tiles[0];
    let mut pool = CommandPool::new(LaneId::Zero);
    let batch = vec![
        builder.record_tile(&mut pool, &tile).unwrap(),
        builder.record_tile(&mut pool, &tile).unwrap(),
    ];
    let fence = Fence::new();
    dev.submit(LaneId::Zero, batch, &fence).unwrap();
    dev.wait_for_fences(&[&fence], WAIT).unwrap();

    assert_eq!(dev.stats().validation_findings, canvas.pixel_count());
    assert_eq!(sink.count(Severity::Error), 1);
    assert_eq!(sink.count(Severity::Info), 1);
}

#[test]
fn execution_failure_marks_fence_lost() {
    let dev = device(DeviceOptions::default());
    let storage = dev.create_storage_buffer(1024).unwrap();
    let builder =
        CommandBuilder::new(KernelId(9_999), storage, 16, DispatchRounding::Ceil).unwrap();
    let tile = TileScheduler::new(
        Canvas {
            width: 8,
            height: 8,
        },
        TileSize::square(8),
    )
    .unwrap()
    .grid()
    .tiles[0];
    let mut pool = CommandPool::new(LaneId::Zero);
    let cb = builder.record_tile(&mut pool, &tile).unwrap();
    let fence = Fence::new();
    dev.submit(LaneId::Zero, vec![cb], &fence).unwrap();
    let err = dev.wait_for_fences(&[&fence], WAIT).unwrap_err();
    assert!(matches!(err, FractError::Device(_)));
    assert!(err.to_string().contains("unknown kernel"));
}

#[test]
fn signaled_fence_and_foreign_lane_are_rejected() {
    let dev = device(DeviceOptions::default());
    let staging = dev.create_staging_buffer(64).unwrap();
    let storage = dev.create_storage_buffer(64).unwrap();

    let fence = Fence::new();
    fence.signal();
    let mut pool = CommandPool::new(LaneId::Zero);
    let cb = record_copy(&mut pool, storage, staging, 64).unwrap();
    assert!(dev.submit(LaneId::Zero, vec![cb], &fence).is_err());

    let cb = record_copy(&mut pool, storage, staging, 64).unwrap();
    assert!(dev.submit(LaneId::One, vec![cb], &Fence::new()).is_err());
    assert_eq!(dev.stats().submissions, 0);
}

#[test]
fn slow_dispatch_times_out_and_blocks_staging_reads() {
    let canvas = Canvas {
        width: 8,
        height: 8,
    };
    let dev = device(DeviceOptions {
        cpu: CpuDeviceOptions {
            dispatch_delay: Some(Duration::from_millis(300)),
            threads: Some(1),
        },
        ..DeviceOptions::default()
    });
    let bytes = canvas.pixel_buffer_bytes().unwrap();
    let storage = dev.create_storage_buffer(bytes).unwrap();
    let staging = dev.create_staging_buffer(bytes).unwrap();
    let kernel = dev
        .create_kernel(&KernelDesc {
            tile: TileSize::square(8),
            ..desc(canvas)
        })
        .unwrap();
    let builder = CommandBuilder::new(kernel, storage, 8, DispatchRounding::Ceil).unwrap();
    let tile = TileScheduler::new(canvas, TileSize::square(8))
        .unwrap()
        .grid()
        .tiles[0];
    let mut pool = CommandPool::new(LaneId::Zero);
    let batch = vec![
        builder.record_tile(&mut pool, &tile).unwrap(),
        record_copy(&mut pool, storage, staging, bytes).unwrap(),
    ];
    let fence = Fence::new();
    dev.submit(LaneId::Zero, batch, &fence).unwrap();

    let err = dev
        .wait_for_fences(&[&fence], Duration::from_millis(10))
        .unwrap_err();
    assert!(matches!(err, FractError::Timeout(_)));
    assert!(dev.map_read(staging, 0, bytes, &mut |_| {}).is_err());

    dev.wait_for_fences(&[&fence], WAIT).unwrap();
    dev.map_read(staging, 0, bytes, &mut |_| {}).unwrap();
}

#[test]
fn destroy_is_checked() {
    let dev = device(DeviceOptions::default());
    let b = dev.create_storage_buffer(16).unwrap();
    dev.destroy_buffer(b).unwrap();
    assert!(dev.destroy_buffer(b).is_err());
    assert!(dev.destroy_kernel(KernelId(12_345)).is_err());
    assert!(dev.create_storage_buffer(0).is_err());
}

#[test]
fn zero_threads_is_a_config_error() {
    let err = CpuDevice::new(DeviceOptions {
        cpu: CpuDeviceOptions {
            threads: Some(0),
            ..CpuDeviceOptions::default()
        },
        ..DeviceOptions::default()
    })
    .err()
    .unwrap();
    assert!(err.is_config());
}

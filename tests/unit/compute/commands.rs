use super::*;

#[test]
fn params_serialize_as_two_le_u32() {
    let p = TileParams {
        off_x: 32,
        off_y: 0x0102_0304,
    };
    let b = p.to_le_bytes();
    assert_eq!(&b[0..4], &[32, 0, 0, 0]);
    assert_eq!(&b[4..8], &[4, 3, 2, 1]);
}

#[test]
fn pool_allocates_sequential_lane_buffers() {
    let mut pool = CommandPool::new(LaneId::One);
    let a = pool.allocate();
    let b = pool.allocate();
    assert_eq!(pool.allocated(), 2);
    assert_eq!(a.lane(), LaneId::One);
    assert_eq!(a.id().pool, pool.id());
    assert_eq!((a.id().seq, b.id().seq), (0, 1));
    assert_eq!(a.state(), CommandBufferState::Initial);
}

#[test]
fn pools_get_distinct_ids() {
    let a = CommandPool::new(LaneId::Zero);
    let b = CommandPool::new(LaneId::Zero);
    assert_ne!(a.id(), b.id());
}

#[test]
fn lifecycle_is_enforced() {
    let mut pool = CommandPool::new(LaneId::Zero);
    let mut cb = pool.allocate();
    assert!(cb.record(Command::Dispatch(DispatchSize { x: 1, y: 1, z: 1 })).is_err());
    assert!(cb.end().is_err());
    cb.begin().unwrap();
    assert!(cb.begin().is_err());
    cb.record(Command::BindKernel(KernelId(1))).unwrap();
    cb.record(Command::BindStorage {
        binding: PIXEL_BUFFER_BINDING,
        buffer: BufferId(1),
    })
    .unwrap();
    cb.record(Command::Dispatch(DispatchSize { x: 2, y: 2, z: 1 }))
        .unwrap();
    cb.end().unwrap();
    assert!(cb.is_executable());
    assert!(cb.record(Command::BindKernel(KernelId(1))).is_err());
    assert_eq!(cb.commands().len(), 3);
}

#[test]
fn dispatch_without_bindings_fails_to_end() {
    let mut pool = CommandPool::new(LaneId::Zero);
    let mut cb = pool.allocate();
    cb.begin().unwrap();
    cb.record(Command::BindKernel(KernelId(1))).unwrap();
    cb.record(Command::Dispatch(DispatchSize { x: 1, y: 1, z: 1 }))
        .unwrap();
    let err = cb.end().unwrap_err();
    assert!(matches!(err, FractError::State(_)));
}

#[test]
fn copy_only_buffer_needs_no_bindings() {
    let mut pool = CommandPool::new(LaneId::Zero);
    let mut cb = pool.allocate();
    cb.begin().unwrap();
    cb.record(Command::CopyBuffer {
        src: BufferId(1),
        dst: BufferId(2),
        bytes: 64,
    })
    .unwrap();
    cb.end().unwrap();
    assert!(cb.is_executable());
}

#[test]
fn dispatch_group_total() {
    assert_eq!(DispatchSize { x: 2, y: 3, z: 1 }.groups(), 6);
}

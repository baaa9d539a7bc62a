use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    compute::scheduler::Tile,
    device::backend::{BufferId, KernelId},
    foundation::{
        core::LaneId,
        error::{FractError, FractResult},
    },
};

/// Binding slot of the pixel buffer in the kernel's resource layout.
pub const PIXEL_BUFFER_BINDING: u32 = 0;

/// Parameter block attached to one dispatch: the tile's pixel-space origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileParams {
    pub off_x: u32,
    pub off_y: u32,
}

impl TileParams {
    pub const BYTES: usize = 8;

    pub fn for_tile(tile: &Tile) -> Self {
        Self {
            off_x: tile.origin_x,
            off_y: tile.origin_y,
        }
    }

    pub fn to_le_bytes(self) -> [u8; Self::BYTES] {
        let mut out = [0u8; Self::BYTES];
        out[0..4].copy_from_slice(&self.off_x.to_le_bytes());
        out[4..8].copy_from_slice(&self.off_y.to_le_bytes());
        out
    }
}

/// Workgroup counts of one dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DispatchSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchSize {
    pub fn groups(self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    PushParams(TileParams),
    BindKernel(KernelId),
    BindStorage { binding: u32, buffer: BufferId },
    Dispatch(DispatchSize),
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        bytes: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandBufferId {
    pub pool: PoolId,
    pub seq: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

/// Host-side recording of device work, owned by one lane.
///
/// Buffers are one-time use: [`ComputeDevice::submit`](crate::ComputeDevice::submit) takes them
/// by value and rejects anything that is not [`CommandBufferState::Executable`].
#[derive(Debug)]
pub struct CommandBuffer {
    id: CommandBufferId,
    lane: LaneId,
    state: CommandBufferState,
    tile: Option<usize>,
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn id(&self) -> CommandBufferId {
        self.id
    }

    pub fn lane(&self) -> LaneId {
        self.lane
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Index of the tile this buffer was recorded for, if any.
    pub fn tile(&self) -> Option<usize> {
        self.tile
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_executable(&self) -> bool {
        self.state == CommandBufferState::Executable
    }

    pub fn begin(&mut self) -> FractResult<()> {
        if self.state != CommandBufferState::Initial {
            return Err(FractError::state(format!(
                "command buffer {:?} begin from {:?}",
                self.id, self.state
            )));
        }
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    pub fn record(&mut self, cmd: Command) -> FractResult<()> {
        if self.state != CommandBufferState::Recording {
            return Err(FractError::state(format!(
                "command buffer {:?} is not recording ({:?})",
                self.id, self.state
            )));
        }
        self.commands.push(cmd);
        Ok(())
    }

    /// Finish recording. Every dispatch must follow a kernel bind and a pixel buffer bind.
    pub fn end(&mut self) -> FractResult<()> {
        if self.state != CommandBufferState::Recording {
            return Err(FractError::state(format!(
                "command buffer {:?} end from {:?}",
                self.id, self.state
            )));
        }
        let mut kernel = false;
        let mut storage = false;
        for cmd in &self.commands {
            match cmd {
                Command::BindKernel(_) => kernel = true,
                Command::BindStorage { binding, .. } if *binding == PIXEL_BUFFER_BINDING => {
                    storage = true
                }
                Command::Dispatch(_) if !(kernel && storage) => {
                    return Err(FractError::state(format!(
                        "command buffer {:?} dispatches before binding kernel and pixel buffer",
                        self.id
                    )));
                }
                _ => {}
            }
        }
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    pub(crate) fn set_tile(&mut self, tile: usize) {
        self.tile = Some(tile);
    }
}

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Lane-private allocator of command buffers.
#[derive(Debug)]
pub struct CommandPool {
    id: PoolId,
    lane: LaneId,
    allocated: u32,
}

impl CommandPool {
    pub fn new(lane: LaneId) -> Self {
        Self {
            id: PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            lane,
            allocated: 0,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn lane(&self) -> LaneId {
        self.lane
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn allocate(&mut self) -> CommandBuffer {
        let seq = self.allocated;
        self.allocated += 1;
        CommandBuffer {
            id: CommandBufferId { pool: self.id, seq },
            lane: self.lane,
            state: CommandBufferState::Initial,
            tile: None,
            commands: Vec::new(),
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/compute/commands.rs"]
mod tests;

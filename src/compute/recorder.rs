use crate::{
    compute::{
        commands::{
            Command, CommandBuffer, CommandPool, DispatchSize, PIXEL_BUFFER_BINDING, TileParams,
        },
        scheduler::Tile,
    },
    device::backend::{BufferId, KernelId},
    foundation::{
        config::DispatchRounding,
        error::{FractError, FractResult},
    },
};

/// Number of groups needed along one axis. Computed in 64 bits; a count that does not fit a
/// dispatch dimension is a configuration error.
pub fn group_count(extent: u32, group: u32, rounding: DispatchRounding) -> FractResult<u32> {
    if group == 0 {
        return Err(FractError::config("group_size must be >= 1"));
    }
    let (wide_extent, wide_group) = (u64::from(extent), u64::from(group));
    let groups = match rounding {
        DispatchRounding::Ceil => wide_extent.div_ceil(wide_group),
        DispatchRounding::LegacyOverflow => (wide_extent + wide_group) / wide_group,
    };
    u32::try_from(groups).map_err(|_| {
        FractError::config(format!(
            "extent {extent} needs {groups} groups of {group}, too many for one dispatch"
        ))
    })
}

/// Dispatch covering a tile. X always rounds up; Y follows `rounding`.
pub fn dispatch_for_tile(
    tile: &Tile,
    group: u32,
    rounding: DispatchRounding,
) -> FractResult<DispatchSize> {
    Ok(DispatchSize {
        x: group_count(tile.width, group, DispatchRounding::Ceil)?,
        y: group_count(tile.height, group, rounding)?,
        z: 1,
    })
}

/// Records one self-contained compute invocation per tile.
#[derive(Clone, Copy, Debug)]
pub struct CommandBuilder {
    kernel: KernelId,
    pixel_buffer: BufferId,
    group_size: u32,
    rounding: DispatchRounding,
}

impl CommandBuilder {
    pub fn new(
        kernel: KernelId,
        pixel_buffer: BufferId,
        group_size: u32,
        rounding: DispatchRounding,
    ) -> FractResult<Self> {
        if group_size == 0 {
            return Err(FractError::config("group_size must be >= 1"));
        }
        Ok(Self {
            kernel,
            pixel_buffer,
            group_size,
            rounding,
        })
    }

    pub fn dispatch_size(&self, tile: &Tile) -> FractResult<DispatchSize> {
        dispatch_for_tile(tile, self.group_size, self.rounding)
    }

    /// Params, kernel bind, pixel buffer bind, dispatch; left submit-ready.
    pub fn record_tile(&self, pool: &mut CommandPool, tile: &Tile) -> FractResult<CommandBuffer> {
        if tile.lane() != pool.lane() {
            return Err(FractError::state(format!(
                "tile {} belongs to {} but pool {:?} is owned by {}",
                tile.index,
                tile.lane(),
                pool.id(),
                pool.lane()
            )));
        }
        let mut cb = pool.allocate();
        cb.begin()?;
        cb.record(Command::PushParams(TileParams::for_tile(tile)))?;
        cb.record(Command::BindKernel(self.kernel))?;
        cb.record(Command::BindStorage {
            binding: PIXEL_BUFFER_BINDING,
            buffer: self.pixel_buffer,
        })?;
        cb.record(Command::Dispatch(self.dispatch_size(tile)?))?;
        cb.end()?;
        cb.set_tile(tile.index);
        Ok(cb)
    }

    /// Record every tile of one lane, preserving order.
    #[tracing::instrument(skip(self, pool, tiles), fields(lane = %pool.lane(), tiles = tiles.len()))]
    pub fn record_lane(
        &self,
        pool: &mut CommandPool,
        tiles: &[Tile],
    ) -> FractResult<Vec<CommandBuffer>> {
        tiles.iter().map(|t| self.record_tile(pool, t)).collect()
    }
}

/// Single buffer-to-buffer transfer, used to move results into the staging buffer.
pub fn record_copy(
    pool: &mut CommandPool,
    src: BufferId,
    dst: BufferId,
    bytes: u64,
) -> FractResult<CommandBuffer> {
    let mut cb = pool.allocate();
    cb.begin()?;
    cb.record(Command::CopyBuffer { src, dst, bytes })?;
    cb.end()?;
    Ok(cb)
}

#[cfg(test)]
#[path = "../../tests/unit/compute/recorder.rs"]
mod tests;

use std::time::Duration;

use crate::{
    compute::{commands::CommandPool, fence::Fence, recorder::record_copy},
    device::backend::{BufferId, ComputeDevice},
    foundation::{
        core::{Canvas, LaneId, Pixel, RasterRgba8},
        error::{FractError, FractResult},
    },
};

/// `round(255 * clamp(v, 0, 1))`; NaN maps to 0.
pub fn quantize_channel(v: f32) -> u8 {
    if v.is_nan() {
        return 0;
    }
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Moves the finished pixel buffer to the host as packed RGBA8.
pub struct ResultExtractor<'d> {
    device: &'d dyn ComputeDevice,
    timeout: Duration,
}

struct StagingGuard<'d> {
    device: &'d dyn ComputeDevice,
    id: BufferId,
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_buffer(self.id) {
            tracing::warn!(buffer = ?self.id, error = %e, "failed to release staging buffer");
        }
    }
}

impl<'d> ResultExtractor<'d> {
    pub fn new(device: &'d dyn ComputeDevice, timeout: Duration) -> Self {
        Self { device, timeout }
    }

    /// Copy `pixels` into a fresh staging buffer, wait on the copy's own fence, then read it back
    /// row by row. Must only be called once both lanes have signaled.
    #[tracing::instrument(skip(self, canvas), fields(canvas = %canvas))]
    pub fn extract(&self, pixels: BufferId, canvas: Canvas) -> FractResult<RasterRgba8> {
        let bytes = canvas.pixel_buffer_bytes()?;
        let staging = StagingGuard {
            device: self.device,
            id: self.device.create_staging_buffer(bytes)?,
        };

        let mut pool = CommandPool::new(LaneId::Zero);
        let copy = record_copy(&mut pool, pixels, staging.id, bytes)?;
        let fence = Fence::new();
        self.device.submit(LaneId::Zero, vec![copy], &fence)?;
        self.device
            .wait_for_fences(&[&fence], self.timeout)
            .inspect_err(|e| {
                if matches!(e, FractError::Timeout(_)) {
                    tracing::error!(error = %e, "device hung: staging copy never completed");
                }
            })?;

        let row_bytes = u64::from(canvas.width) * Pixel::BYTES as u64;
        let mut data = Vec::with_capacity(canvas.rgba8_bytes());
        let mut decode_err = None;
        for y in 0..u64::from(canvas.height) {
            self.device
                .map_read(staging.id, y * row_bytes, row_bytes, &mut |row| {
                    for px in row.chunks_exact(Pixel::BYTES) {
                        match Pixel::from_le_bytes(px) {
                            Ok(p) => data.extend(p.channels().map(quantize_channel)),
                            Err(e) => {
                                decode_err.get_or_insert(e);
                            }
                        }
                    }
                })?;
            if let Some(e) = decode_err.take() {
                return Err(e);
            }
        }
        if data.len() != canvas.rgba8_bytes() {
            return Err(FractError::device(format!(
                "read back {} bytes, expected {}",
                data.len(),
                canvas.rgba8_bytes()
            )));
        }
        tracing::debug!(bytes = data.len(), "extracted raster");
        Ok(RasterRgba8 {
            width: canvas.width,
            height: canvas.height,
            data,
        })
    }
}

#[cfg(test)]
#[path = "../../tests/unit/compute/extract.rs"]
mod tests;

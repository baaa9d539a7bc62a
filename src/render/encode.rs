use std::path::{Path, PathBuf};

use crate::foundation::{
    core::RasterRgba8,
    error::{FractError, FractResult},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RasterFormat {
    Bmp,
    Png,
}

impl RasterFormat {
    /// From the file extension; no extension means BMP.
    pub fn from_path(path: &Path) -> FractResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            None | Some("bmp") => Ok(Self::Bmp),
            Some("png") => Ok(Self::Png),
            Some(other) => Err(FractError::config(format!(
                "unsupported output extension '.{other}' (expected .bmp or .png)"
            ))),
        }
    }

    fn image_format(self) -> image::ImageFormat {
        match self {
            Self::Bmp => image::ImageFormat::Bmp,
            Self::Png => image::ImageFormat::Png,
        }
    }
}

/// Persist a raster, creating parent directories as needed.
pub fn write_raster(raster: &RasterRgba8, path: &Path) -> FractResult<()> {
    let format = RasterFormat::from_path(path)?;
    let expected = raster.width as usize * raster.height as usize * 4;
    if raster.data.len() != expected {
        return Err(FractError::encode(format!(
            "raster holds {} bytes, expected {expected} for {}x{}",
            raster.data.len(),
            raster.width,
            raster.height
        )));
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            FractError::encode(format!("create output dir '{}': {e}", parent.display()))
        })?;
    }
    commit_via_temp(path, |tmp| {
        image::save_buffer_with_format(
            tmp,
            &raster.data,
            raster.width,
            raster.height,
            image::ColorType::Rgba8,
            format.image_format(),
        )
        .map_err(|e| FractError::encode(format!("write '{}': {e}", path.display())))
    })?;
    tracing::info!(path = %path.display(), ?format, "wrote raster");
    Ok(())
}

/// Run `write` against a sibling temp file, then rename it over `path`. On any failure the temp
/// file is removed and `path` is left as it was.
fn commit_via_temp(path: &Path, write: impl FnOnce(&Path) -> FractResult<()>) -> FractResult<()> {
    let name = path.file_name().ok_or_else(|| {
        FractError::config(format!("output '{}' has no file name", path.display()))
    })?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = path.with_file_name(tmp_name);

    let mut guard = TempFileGuard(Some(tmp.clone()));
    write(&tmp)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        FractError::encode(format!("move '{}' into place: {e}", path.display()))
    })?;
    guard.0 = None;
    Ok(())
}

struct TempFileGuard(Option<PathBuf>);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/encode.rs"]
mod tests;

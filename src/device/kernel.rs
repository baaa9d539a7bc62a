//! Compute kernels: one host implementation (software device) and one WGSL implementation (wgpu
//! device) per kernel, kept formula-for-formula in sync.

use crate::foundation::{
    core::{Canvas, Pixel, TileSize},
    error::{FractError, FractResult},
};

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MandelbrotParams {
    pub center_x: f32,
    pub center_y: f32,
    /// Width of the view in the complex plane; the height follows the canvas aspect ratio.
    pub span: f32,
    pub max_iterations: u32,
}

impl Default for MandelbrotParams {
    fn default() -> Self {
        Self {
            center_x: -0.5,
            center_y: 0.0,
            span: 3.0,
            max_iterations: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelSpec {
    Mandelbrot(MandelbrotParams),
    /// Deterministic, position-dependent field; every pixel differs from zero.
    Gradient,
}

impl Default for KernelSpec {
    fn default() -> Self {
        Self::Mandelbrot(MandelbrotParams::default())
    }
}

/// Everything a device needs to build a bindable kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelDesc {
    pub spec: KernelSpec,
    pub canvas: Canvas,
    pub tile: TileSize,
    pub group_size: u32,
}

impl KernelSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mandelbrot(_) => "mandelbrot",
            Self::Gradient => "gradient",
        }
    }

    pub fn validate(&self) -> FractResult<()> {
        match self {
            Self::Mandelbrot(p) => {
                if p.max_iterations == 0 {
                    return Err(FractError::config("mandelbrot max_iterations must be >= 1"));
                }
                if !(p.span.is_finite() && p.span > 0.0) {
                    return Err(FractError::config("mandelbrot span must be finite and > 0"));
                }
                if !(p.center_x.is_finite() && p.center_y.is_finite()) {
                    return Err(FractError::config("mandelbrot center must be finite"));
                }
                Ok(())
            }
            Self::Gradient => Ok(()),
        }
    }

    /// Host evaluation of the kernel at pixel `(x, y)`.
    pub fn shade(&self, canvas: Canvas, x: u32, y: u32) -> Pixel {
        let w = canvas.width as f32;
        let h = canvas.height as f32;
        match self {
            Self::Mandelbrot(p) => {
                let u = (x as f32 + 0.5) / w;
                let v = (y as f32 + 0.5) / h;
                let cx = p.center_x + (u - 0.5) * p.span;
                let cy = p.center_y + (v - 0.5) * p.span * (h / w);
                let (mut zx, mut zy) = (0.0f32, 0.0f32);
                let mut n = 0u32;
                while n < p.max_iterations {
                    let nx = zx * zx - zy * zy + cx;
                    zy = 2.0 * zx * zy + cy;
                    zx = nx;
                    if zx * zx + zy * zy > 4.0 {
                        break;
                    }
                    n += 1;
                }
                if n >= p.max_iterations {
                    return Pixel::new(0.0, 0.0, 0.0, 1.0);
                }
                let t = n as f32 / p.max_iterations as f32;
                Pixel::new(palette(t, 0.0), palette(t, 0.33), palette(t, 0.67), 1.0)
            }
            Self::Gradient => Pixel::new(
                (x as f32 + 0.5) / w,
                (y as f32 + 0.5) / h,
                ((x ^ y) & 255) as f32 / 255.0,
                1.0,
            ),
        }
    }

    /// WGSL source; sizes and parameters arrive as pipeline-overridable constants.
    pub fn wgsl_source(&self) -> String {
        let body = match self {
            Self::Mandelbrot(_) => MANDELBROT_WGSL,
            Self::Gradient => GRADIENT_WGSL,
        };
        format!("{WGSL_PRELUDE}\n{body}")
    }

    /// Values for every `override` declared by [`Self::wgsl_source`].
    pub fn override_constants(&self, desc: &KernelDesc) -> Vec<(&'static str, f64)> {
        let mut out = vec![
            ("CANVAS_W", f64::from(desc.canvas.width)),
            ("CANVAS_H", f64::from(desc.canvas.height)),
            ("TILE_W", f64::from(desc.tile.width)),
            ("TILE_H", f64::from(desc.tile.height)),
            ("GROUP", f64::from(desc.group_size)),
        ];
        if let Self::Mandelbrot(p) = self {
            out.extend([
                ("CENTER_X", f64::from(p.center_x)),
                ("CENTER_Y", f64::from(p.center_y)),
                ("SPAN", f64::from(p.span)),
                ("MAX_ITER", f64::from(p.max_iterations)),
            ]);
        }
        out
    }
}

fn palette(t: f32, phase: f32) -> f32 {
    0.5 + 0.5 * (std::f32::consts::TAU * (t + phase)).cos()
}

const WGSL_PRELUDE: &str = r#"
struct TileParams {
  off_x: u32,
  off_y: u32,
  _pad0: u32,
  _pad1: u32,
};

override CANVAS_W: u32 = 256u;
override CANVAS_H: u32 = 256u;
override TILE_W: u32 = 32u;
override TILE_H: u32 = 32u;
override GROUP: u32 = 16u;

@group(0) @binding(0) var<storage, read_write> pixels: array<vec4<f32>>;
@group(0) @binding(1) var<uniform> params: TileParams;

@compute @workgroup_size(GROUP, GROUP, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  if (gid.x >= TILE_W || gid.y >= TILE_H) {
    return;
  }
  let x = params.off_x + gid.x;
  let y = params.off_y + gid.y;
  if (x >= CANVAS_W || y >= CANVAS_H) {
    return;
  }
  pixels[y * CANVAS_W + x] = shade(x, y);
}
"#;

const MANDELBROT_WGSL: &str = r#"
override CENTER_X: f32 = -0.5;
override CENTER_Y: f32 = 0.0;
override SPAN: f32 = 3.0;
override MAX_ITER: u32 = 256u;

fn palette(t: f32, phase: f32) -> f32 {
  return 0.5 + 0.5 * cos(6.28318530718 * (t + phase));
}

fn shade(x: u32, y: u32) -> vec4<f32> {
  let w = f32(CANVAS_W);
  let h = f32(CANVAS_H);
  let u = (f32(x) + 0.5) / w;
  let v = (f32(y) + 0.5) / h;
  let cx = CENTER_X + (u - 0.5) * SPAN;
  let cy = CENTER_Y + (v - 0.5) * SPAN * (h / w);
  var zx = 0.0;
  var zy = 0.0;
  var n = 0u;
  loop {
    if (n >= MAX_ITER) {
      break;
    }
    let nx = zx * zx - zy * zy + cx;
    zy = 2.0 * zx * zy + cy;
    zx = nx;
    if (zx * zx + zy * zy > 4.0) {
      break;
    }
    n = n + 1u;
  }
  if (n >= MAX_ITER) {
    return vec4<f32>(0.0, 0.0, 0.0, 1.0);
  }
  let t = f32(n) / f32(MAX_ITER);
  return vec4<f32>(palette(t, 0.0), palette(t, 0.33), palette(t, 0.67), 1.0);
}
"#;

const GRADIENT_WGSL: &str = r#"
fn shade(x: u32, y: u32) -> vec4<f32> {
  return vec4<f32>(
    (f32(x) + 0.5) / f32(CANVAS_W),
    (f32(y) + 0.5) / f32(CANVAS_H),
    f32((x ^ y) & 255u) / 255.0,
    1.0,
  );
}
"#;

#[cfg(test)]
#[path = "../../tests/unit/device/kernel.rs"]
mod tests;

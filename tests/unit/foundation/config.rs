use super::*;

#[test]
fn defaults_match_reference_run() {
    let cfg = RenderConfig::default();
    assert_eq!(cfg.canvas, Canvas::default());
    assert_eq!(cfg.canvas.width, 256);
    assert_eq!(cfg.tile, TileSize::square(32));
    assert_eq!(cfg.group_size, 16);
    assert_eq!(cfg.submit.mode, SubmitMode::Joint);
    assert_eq!(cfg.submit.iterations, 1);
    assert_eq!(cfg.fence_timeout(), Duration::from_secs(100));
    assert_eq!(cfg.dispatch_rounding, DispatchRounding::Ceil);
    assert!(!cfg.validation.enabled);
    assert_eq!(cfg.validation.layer, "VK_LAYER_KHRONOS_validation");
    cfg.validate().unwrap();
}

#[test]
fn json_fills_missing_fields_with_defaults() {
    let cfg = RenderConfig::from_json_str(
        r#"{ "canvas": { "width": 64, "height": 32 }, "submit": { "mode": "threaded" } }"#,
    )
    .unwrap();
    assert_eq!(cfg.canvas.width, 64);
    assert_eq!(cfg.canvas.height, 32);
    assert_eq!(cfg.submit.mode, SubmitMode::Threaded);
    assert_eq!(cfg.submit.iterations, 1);
    assert_eq!(cfg.tile, TileSize::square(32));
}

#[test]
fn json_rejects_unknown_fields() {
    let err = RenderConfig::from_json_str(r#"{ "canvass": {} }"#).unwrap_err();
    assert!(err.is_config());
}

#[test]
fn rounding_parses_snake_case() {
    let cfg = RenderConfig::from_json_str(r#"{ "dispatch_rounding": "legacy_overflow" }"#).unwrap();
    assert_eq!(cfg.dispatch_rounding, DispatchRounding::LegacyOverflow);
}

#[test]
fn validate_rejects_untileable_canvas() {
    let cfg = RenderConfig {
        canvas: Canvas {
            width: 100,
            height: 64,
        },
        tile: TileSize::square(32),
        ..RenderConfig::default()
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("not an exact multiple"));
}

#[test]
fn validate_rejects_zero_knobs() {
    let zero_tile = RenderConfig {
        tile: TileSize {
            width: 0,
            height: 8,
        },
        ..RenderConfig::default()
    };
    assert!(zero_tile.validate().unwrap_err().is_config());

    let zero_group = RenderConfig {
        group_size: 0,
        ..RenderConfig::default()
    };
    assert!(zero_group.validate().unwrap_err().is_config());

    let zero_iters = RenderConfig {
        submit: SubmitConfig {
            mode: SubmitMode::Threaded,
            iterations: 0,
        },
        ..RenderConfig::default()
    };
    assert!(zero_iters.validate().unwrap_err().is_config());

    let zero_timeout = RenderConfig {
        fence_timeout_ms: 0,
        ..RenderConfig::default()
    };
    assert!(zero_timeout.validate().unwrap_err().is_config());
}

#[test]
fn validate_rejects_canvas_beyond_pixel_memory_cap() {
    let cfg = RenderConfig {
        canvas: Canvas {
            width: u32::MAX,
            height: u32::MAX,
        },
        tile: TileSize::square(u32::MAX),
        ..RenderConfig::default()
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("pixel memory"));
}

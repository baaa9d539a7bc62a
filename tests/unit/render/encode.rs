use std::path::PathBuf;

use super::*;

fn scratch(name: &str) -> PathBuf {
    let dir = PathBuf::from("target").join("unit_encode");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn checker(w: u32, h: u32) -> RasterRgba8 {
    let mut data = Vec::with_capacity((w * h * 4) as usize);
    for y in 0..h {
        for x in 0..w {
            let v = if (x + y) % 2 == 0 { 255 } else { 0 };
            data.extend_from_slice(&[v, x as u8, y as u8, 255]);
        }
    }
    RasterRgba8 {
        width: w,
        height: h,
        data,
    }
}

#[test]
fn format_follows_extension() {
    assert_eq!(
        RasterFormat::from_path(Path::new("a/out.bmp")).unwrap(),
        RasterFormat::Bmp
    );
    assert_eq!(
        RasterFormat::from_path(Path::new("OUT.PNG")).unwrap(),
        RasterFormat::Png
    );
    assert_eq!(
        RasterFormat::from_path(Path::new("plain")).unwrap(),
        RasterFormat::Bmp
    );
    assert!(
        RasterFormat::from_path(Path::new("x.jpg"))
            .unwrap_err()
            .is_config()
    );
}

#[test]
fn png_round_trips_pixels() {
    let path = scratch("checker.png");
    let raster = checker(7, 5);
    write_raster(&raster, &path).unwrap();
    let back = image::open(&path).unwrap().to_rgba8();
    assert_eq!(back.dimensions(), (7, 5));
    assert_eq!(back.into_raw(), raster.data);
}

#[test]
fn bmp_is_written_with_canvas_dimensions() {
    let path = scratch("nested/checker.bmp");
    let _ = std::fs::remove_file(&path);
    write_raster(&checker(16, 8), &path).unwrap();
    let img = image::open(&path).unwrap();
    assert_eq!((img.width(), img.height()), (16, 8));
}

#[test]
fn short_raster_is_an_encode_error() {
    let mut raster = checker(4, 4);
    raster.data.pop();
    let err = write_raster(&raster, &scratch("short.png")).unwrap_err();
    assert!(matches!(err, FractError::Encode(_)));
}

#[test]
fn failed_write_leaves_target_untouched_and_no_temp_file() {
    let dir = scratch("failing_sink");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let target = dir.join("out.bmp");
    std::fs::write(&target, b"previous").unwrap();

    let err = commit_via_temp(&target, |tmp| {
        std::fs::write(tmp, b"trunc").unwrap();
        Err(FractError::encode("disk full"))
    })
    .unwrap_err();
    assert!(matches!(err, FractError::Encode(_)));
    assert_eq!(std::fs::read(&target).unwrap(), b"previous");
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

    let fresh = dir.join("fresh.png");
    let _ = commit_via_temp(&fresh, |tmp| {
        std::fs::write(tmp, b"partial").unwrap();
        Err(FractError::encode("broken pipe"))
    });
    assert!(!fresh.exists());
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
}

#[test]
fn successful_write_replaces_target_atomically() {
    let dir = scratch("replace");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let target = dir.join("field.png");
    std::fs::write(&target, b"stale").unwrap();

    write_raster(&checker(3, 2), &target).unwrap();
    let back = image::open(&target).unwrap().to_rgba8();
    assert_eq!(back.into_raw(), checker(3, 2).data);
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
}

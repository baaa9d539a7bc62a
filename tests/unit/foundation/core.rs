use super::*;

#[test]
fn canvas_rejects_empty_dimensions() {
    assert!(Canvas::new(0, 16).unwrap_err().is_config());
    assert!(Canvas::new(16, 0).unwrap_err().is_config());
    let c = Canvas::new(256, 128).unwrap();
    assert_eq!(c.pixel_count(), 256 * 128);
    assert_eq!(c.pixel_buffer_bytes().unwrap(), 256 * 128 * 16);
    assert_eq!(c.rgba8_bytes(), 256 * 128 * 4);
}

#[test]
fn pixel_buffer_size_is_bounded() {
    let edge = Canvas::new(16384, 16384).unwrap();
    assert_eq!(edge.pixel_buffer_bytes().unwrap(), MAX_PIXEL_BUFFER_BYTES);
    assert!(
        Canvas::new(16384, 16385)
            .unwrap()
            .pixel_buffer_bytes()
            .unwrap_err()
            .is_config()
    );
    let huge = Canvas::new(u32::MAX, u32::MAX).unwrap();
    assert!(huge.pixel_buffer_bytes().unwrap_err().is_config());
}

#[test]
fn pixel_byte_layout_is_little_endian_rgba() {
    let bytes: Vec<u8> = [1.0f32, 0.5, 0.25, 0.0]
        .iter()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    let p = Pixel::from_le_bytes(&bytes).unwrap();
    assert_eq!(p, Pixel::new(1.0, 0.5, 0.25, 0.0));
    assert!(Pixel::from_le_bytes(&bytes[..15]).is_err());
}

#[test]
fn lane_parity_is_checkerboard() {
    assert_eq!(LaneId::from_parity(0), LaneId::Zero);
    assert_eq!(LaneId::from_parity(1), LaneId::One);
    assert_eq!(LaneId::from_parity(2), LaneId::Zero);
    assert_eq!(LaneId::One.index(), 1);
    assert_eq!(LaneId::One.to_string(), "lane1");
}

#[test]
fn raster_pixel_lookup_is_bounds_checked() {
    let r = RasterRgba8 {
        width: 2,
        height: 1,
        data: vec![1, 2, 3, 4, 5, 6, 7, 8],
    };
    assert_eq!(r.pixel(1, 0), Some([5, 6, 7, 8]));
    assert_eq!(r.pixel(2, 0), None);
    assert_eq!(r.pixel(0, 1), None);
}

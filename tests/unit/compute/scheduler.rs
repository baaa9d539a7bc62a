use super::*;

fn scheduler(w: u32, h: u32, tw: u32, th: u32) -> TileScheduler {
    TileScheduler::new(
        Canvas {
            width: w,
            height: h,
        },
        TileSize {
            width: tw,
            height: th,
        },
    )
    .unwrap()
}

#[test]
fn reference_scenario_splits_64_tiles_evenly() {
    let s = scheduler(256, 256, 32, 32).schedule();
    assert_eq!(s.grid.rows, 8);
    assert_eq!(s.grid.cols, 8);
    assert_eq!(s.grid.len(), 64);
    assert_eq!(s.lane_sizes(), [32, 32]);

    assert_eq!(s.grid.tile_at(0, 0).unwrap().lane(), LaneId::Zero);
    assert_eq!(s.grid.tile_at(0, 1).unwrap().lane(), LaneId::One);
    assert_eq!(s.grid.tile_at(1, 1).unwrap().lane(), LaneId::Zero);
    assert_eq!(s.grid.tile_at(1, 0).unwrap().lane(), LaneId::One);
}

#[test]
fn grid_is_row_major_with_pixel_origins() {
    let g = scheduler(64, 32, 16, 8).grid();
    assert_eq!((g.rows, g.cols), (4, 4));
    let t = g.tiles[5];
    assert_eq!((t.row, t.col), (1, 1));
    assert_eq!((t.origin_x, t.origin_y), (16, 8));
    for (idx, t) in g.tiles.iter().enumerate() {
        assert_eq!(t.index, idx);
        assert_eq!((t.width, t.height), (16, 8));
    }
}

#[test]
fn grid_covers_every_pixel_exactly_once() {
    for &(w, h, tw, th) in &[
        (256, 256, 32, 32),
        (64, 48, 16, 8),
        (30, 10, 5, 10),
        (8, 8, 8, 8),
        (12, 7, 1, 7),
    ] {
        let g = scheduler(w, h, tw, th).grid();
        let mut hits = vec![0u8; (w * h) as usize];
        for t in &g.tiles {
            for y in t.origin_y..t.origin_y + t.height {
                for x in t.origin_x..t.origin_x + t.width {
                    hits[(y * w + x) as usize] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&n| n == 1), "{w}x{h} / {tw}x{th}");
        for y in 0..h {
            for x in 0..w {
                assert!(g.tile_for_pixel(x, y).unwrap().contains(x, y));
            }
        }
    }
}

#[test]
fn lanes_are_a_disjoint_cover() {
    let s = scheduler(96, 64, 16, 16).schedule();
    let mut seen = vec![0u8; s.grid.len()];
    for lane in LaneId::ALL {
        for t in s.lane(lane) {
            assert_eq!(t.lane(), lane);
            seen[t.index] += 1;
        }
    }
    assert!(seen.iter().all(|&n| n == 1));
    assert_eq!(s.grid.len() % 2, 0);
    assert_eq!(s.lane_sizes()[0], s.lane_sizes()[1]);
}

#[test]
fn lane_lists_keep_row_major_order() {
    let s = scheduler(64, 64, 16, 16).schedule();
    for lane in LaneId::ALL {
        let idx: Vec<usize> = s.lane(lane).iter().map(|t| t.index).collect();
        let mut sorted = idx.clone();
        sorted.sort_unstable();
        assert_eq!(idx, sorted);
    }
}

#[test]
fn odd_tile_count_differs_by_one() {
    let s = scheduler(48, 48, 16, 16).schedule();
    assert_eq!(s.grid.len(), 9);
    assert_eq!(s.lane_sizes(), [5, 4]);
}

#[test]
fn rejects_non_dividing_tiles() {
    let canvas = Canvas {
        width: 100,
        height: 64,
    };
    let err = TileScheduler::new(canvas, TileSize::square(32)).unwrap_err();
    assert!(err.is_config());
    assert!(TileScheduler::new(canvas, TileSize::square(0)).is_err());
    assert!(
        TileScheduler::new(
            Canvas {
                width: 0,
                height: 0
            },
            TileSize::square(1)
        )
        .is_err()
    );
}

#[test]
fn out_of_range_lookups_are_none() {
    let g = scheduler(32, 32, 16, 16).grid();
    assert!(g.tile_at(2, 0).is_none());
    assert!(g.tile_for_pixel(32, 0).is_none());
}

use crate::elevator::{Extent, elevator_sort, elevator_sweeps};

fn assert_sweep_ordered(sweep: &[(u64, u64)]) {
    for pair in sweep.windows(2) {
        assert!(pair[0].end() <= pair[1].start(), "overlap in sweep {:?}", sweep);
    }
}

#[test]
fn test_elevator_overlap_starts_new_sweep() {
    let sweeps = elevator_sweeps(vec![(8, 4), (2, 2), (0, 8), (4, 4)]);
    assert_eq!(sweeps, vec![vec![(0, 8), (8, 4)], vec![(2, 2), (4, 4)]]);
}

#[test]
fn test_elevator_longer_first_on_equal_offset() {
    let mut items = vec![(0, 4), (0, 8), (16, 1)];
    let sweeps = elevator_sort(&mut items);
    assert_eq!(sweeps, 2);
    assert_eq!(items, vec![(0, 8), (16, 1), (0, 4)]);
}

#[test]
fn test_elevator_disjoint_single_sweep() {
    let mut items = vec![(4096, 512), (0, 512), (1024, 1024), (512, 512)];
    assert_eq!(elevator_sort(&mut items), 1);
    assert_eq!(items, vec![(0, 512), (512, 512), (1024, 1024), (4096, 512)]);
}

#[test]
fn test_elevator_empty() {
    let mut items: Vec<(u64, u64)> = Vec::new();
    assert_eq!(elevator_sort(&mut items), 0);
    assert!(elevator_sweeps(items).is_empty());
}

#[test]
fn test_elevator_random() {
    for _ in 0..200 {
        let count = fastrand::usize(1..64);
        let items: Vec<(u64, u64)> =
            (0..count).map(|_| (fastrand::u64(0..64) * 512, fastrand::u64(1..9) * 512)).collect();
        let sweeps = elevator_sweeps(items.clone());
        let total: usize = sweeps.iter().map(|s| s.len()).sum();
        assert_eq!(total, items.len());
        for sweep in sweeps.iter() {
            assert!(!sweep.is_empty());
            assert_sweep_ordered(sweep);
        }
        // Every deferred item overlaps something in the sweep before it.
        for pair in sweeps.windows(2) {
            for item in pair[1].iter() {
                assert!(pair[0].iter().any(|p| p.start() < item.end() && item.start() < p.end()));
            }
        }
        let mut flat = items.clone();
        assert_eq!(elevator_sort(&mut flat), sweeps.len());
        assert_eq!(flat, sweeps.concat());
    }
}

//! MEGA's progressive chunk plan.
//!
//! Chunk boundaries start at 128 KiB and grow by 128 KiB per chunk until
//! they reach the fixed 1 MiB stride:
//! 0 / 128K / 384K / 768K / 1280K / 1920K / 2688K / 3584K, then +1 MiB.
//! The final chunk is truncated at the file size. Every boundary is
//! 16-byte aligned, so per-chunk CTR counters start on block boundaries.

const KB: u64 = 1024;

/// Boundaries of the growing head chunks.
const INITIAL_BOUNDARIES: [u64; 8] = [
    0,
    128 * KB,
    384 * KB,
    768 * KB,
    1280 * KB,
    1920 * KB,
    2688 * KB,
    3584 * KB,
];

const REGULAR_STRIDE: u64 = 1024 * KB;

/// One chunk of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

impl Chunk {
    /// CTR block counter for the first block of this chunk.
    pub fn counter_start(&self) -> u64 {
        self.offset / 16
    }
}

/// Compute the chunk plan for a file of `size` bytes.
pub fn chunk_plan(size: u64) -> Vec<Chunk> {
    if size == 0 {
        return Vec::new();
    }

    let mut boundaries: Vec<u64> = INITIAL_BOUNDARIES
        .iter()
        .copied()
        .take_while(|b| *b < size)
        .collect();

    let mut next = *INITIAL_BOUNDARIES.last().unwrap() + REGULAR_STRIDE;
    while next < size {
        boundaries.push(next);
        next += REGULAR_STRIDE;
    }
    boundaries.push(size);

    boundaries
        .windows(2)
        .enumerate()
        .map(|(index, pair)| Chunk {
            index,
            offset: pair[0],
            len: pair[1] - pair[0],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_has_no_chunks() {
        assert!(chunk_plan(0).is_empty());
    }

    #[test]
    fn single_small_chunk() {
        let plan = chunk_plan(1000);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0], Chunk { index: 0, offset: 0, len: 1000 });
    }

    #[test]
    fn three_mib_plan() {
        // The documented sequence for a 3 MiB file.
        let plan = chunk_plan(3 * 1024 * 1024);
        let expected: Vec<(u64, u64)> = vec![
            (0, 131072),
            (131072, 262144),
            (393216, 393216),
            (786432, 524288),
            (1310720, 655360),
            (1966080, 786432),
            (2752512, 393216),
        ];

        assert_eq!(plan.len(), expected.len());
        for (chunk, (offset, len)) in plan.iter().zip(expected) {
            assert_eq!((chunk.offset, chunk.len), (offset, len));
        }
    }

    #[test]
    fn plan_invariants_hold_for_many_sizes() {
        for size in [1u64, 4096, 131072, 131073, 1048576, 3670016, 50_000_000] {
            let plan = chunk_plan(size);

            // Contiguous coverage summing to the file size.
            let mut expected_offset = 0;
            for chunk in &plan {
                assert_eq!(chunk.offset, expected_offset);
                assert!(chunk.len > 0);
                expected_offset += chunk.len;
            }
            assert_eq!(expected_offset, size);

            // Sizes grow until the 1 MiB cap (final chunk may truncate).
            for pair in plan.windows(2) {
                if pair[1].index != plan.len() - 1 {
                    assert!(pair[1].len >= pair[0].len);
                }
                assert!(pair[0].len <= REGULAR_STRIDE);
            }

            // Chunk offsets stay block-aligned for the CTR counter.
            for chunk in &plan {
                assert_eq!(chunk.offset % 16, 0);
                assert_eq!(chunk.counter_start(), chunk.offset / 16);
            }
        }
    }
}

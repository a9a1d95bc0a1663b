//! BlockPlanner: splits a payload of known length into append-sized blocks.

use std::ops::Range;

use crate::config::{DEFAULT_BLOCK_SIZE, DEFAULT_SINGLE_SHOT_THRESHOLD, MAX_APPEND_SIZE};
use crate::error::{Result, StreamError};

/// `[offset, offset + length)` of the payload, sent by one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u64,
    pub length: u64,
}

impl Block {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Index range into an in-memory payload.
    pub fn as_range(&self) -> Range<usize> {
        self.offset as usize..self.end() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlanner {
    requested_block_size: Option<u64>,
    single_shot_threshold: u64,
    max_append_size: u64,
}

impl Default for BlockPlanner {
    fn default() -> Self {
        Self {
            requested_block_size: None,
            single_shot_threshold: DEFAULT_SINGLE_SHOT_THRESHOLD,
            max_append_size: MAX_APPEND_SIZE,
        }
    }
}

impl BlockPlanner {
    pub fn new(
        requested_block_size: Option<u64>,
        single_shot_threshold: u64,
        max_append_size: u64,
    ) -> Result<Self> {
        if requested_block_size == Some(0) {
            return Err(StreamError::InvalidArgument(
                "block size must be at least 1".into(),
            ));
        }
        if max_append_size == 0 {
            return Err(StreamError::InvalidArgument(
                "max append size must be at least 1".into(),
            ));
        }
        Ok(Self {
            requested_block_size,
            single_shot_threshold,
            max_append_size,
        })
    }

    pub fn with_block_size(block_size: u64) -> Result<Self> {
        Self::new(Some(block_size), DEFAULT_SINGLE_SHOT_THRESHOLD, MAX_APPEND_SIZE)
    }

    /// Size of every block but the last when a payload is split. Requests
    /// above the transport limit are cut down to it.
    pub fn block_size(&self) -> u64 {
        self.requested_block_size
            .unwrap_or(DEFAULT_BLOCK_SIZE)
            .min(self.max_append_size)
    }

    /// True if `total_length` goes out as one append.
    pub fn is_single_shot(&self, total_length: u64) -> bool {
        self.requested_block_size.is_none()
            && total_length <= self.single_shot_threshold
            && total_length <= self.max_append_size
    }

    /// Contiguous, non-overlapping blocks covering `[0, total_length)`.
    /// An empty payload has no blocks; it is still committed by a flush at 0.
    pub fn plan(&self, total_length: u64) -> Vec<Block> {
        if total_length == 0 {
            return Vec::new();
        }
        if self.is_single_shot(total_length) {
            return vec![Block {
                offset: 0,
                length: total_length,
            }];
        }
        let size = self.block_size();
        let count = total_length.div_ceil(size);
        (0..count)
            .map(|i| {
                let offset = i * size;
                Block {
                    offset,
                    length: size.min(total_length - offset),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use quickcheck::quickcheck;

    #[test]
    fn test_three_mib_blocks_over_seven_mib() {
        let planner = BlockPlanner::with_block_size(3 * MIB).unwrap();
        let lengths: Vec<u64> = planner.plan(7 * MIB).iter().map(|b| b.length).collect();
        assert_eq!(lengths, vec![3 * MIB, 3 * MIB, MIB]);
    }

    #[test]
    fn test_single_shot_threshold_boundary() {
        let planner = BlockPlanner::default();
        assert_eq!(planner.plan(100 * MIB).len(), 1);
        let over = 100 * MIB + 1;
        assert_eq!(
            planner.plan(over).len() as u64,
            over.div_ceil(DEFAULT_BLOCK_SIZE)
        );
    }

    #[test]
    fn test_explicit_block_size_disables_single_shot() {
        let planner = BlockPlanner::with_block_size(10 * MIB).unwrap();
        assert_eq!(planner.plan(100 * MIB + 1).len(), 11);
        assert_eq!(planner.plan(MIB).len(), 1);
        assert_eq!(planner.plan(20 * MIB).len(), 2);
    }

    #[test]
    fn test_block_size_above_and_below_default() {
        let smaller = BlockPlanner::with_block_size(MIB).unwrap();
        assert_eq!(smaller.block_size(), MIB);
        let larger = BlockPlanner::with_block_size(16 * MIB).unwrap();
        assert_eq!(larger.block_size(), 16 * MIB);
        let huge = BlockPlanner::with_block_size(MAX_APPEND_SIZE * 3).unwrap();
        assert_eq!(huge.block_size(), MAX_APPEND_SIZE);
        assert_eq!(huge.plan(MAX_APPEND_SIZE * 2 + 5).len(), 3);
    }

    #[test]
    fn test_single_shot_respects_transport_limit() {
        let planner = BlockPlanner::new(None, 1000, 300).unwrap();
        let blocks = planner.plan(900);
        assert!(blocks.iter().all(|b| b.length <= 300));
        assert_eq!(blocks.len() as u64, 900u64.div_ceil(planner.block_size()));
    }

    #[test]
    fn test_empty_payload_has_no_blocks() {
        assert!(BlockPlanner::default().plan(0).is_empty());
        assert!(BlockPlanner::with_block_size(1).unwrap().plan(0).is_empty());
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(matches!(
            BlockPlanner::with_block_size(0),
            Err(StreamError::InvalidArgument(_))
        ));
    }

    quickcheck! {
        fn prop_plan_covers_payload(total: u16, block: u8, threshold: u16) -> bool {
            let total = total as u64;
            let block = (block as u64).max(1);
            let planner = BlockPlanner::new(Some(block), threshold as u64, MAX_APPEND_SIZE).unwrap();
            let plan = planner.plan(total);
            let mut cursor = 0;
            for (i, b) in plan.iter().enumerate() {
                if b.offset != cursor || b.length == 0 || b.length > block {
                    return false;
                }
                if i + 1 < plan.len() && b.length != block {
                    return false;
                }
                cursor = b.end();
            }
            cursor == total
        }

        fn prop_plan_is_deterministic(total: u32, threshold: u32) -> bool {
            let planner = BlockPlanner::new(None, threshold as u64, 1 << 20).unwrap();
            planner.plan(total as u64) == planner.plan(total as u64)
        }
    }
}

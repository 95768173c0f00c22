//! Basic blocks as produced by an upstream disassembly pass.
//!
//! Blocks live in one address-ascending slice that the function pass shares
//! between its workers. The only mutation a pass performs is setting flag bits,
//! so the flag word is atomic and blocks can be flagged through `&BasicBlock`.

use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockFlags: u32 {
        /// Block ends in a call with a known target (or pointer location).
        const CALL = 1 << 0;
        /// Block ends in an unconditional or conditional branch.
        const JMP = 1 << 1;
        /// Block ends in a return.
        const RET = 1 << 2;
        /// Control transfer target is only known at runtime (register operand).
        const INDIRECT = 1 << 3;
        /// `target` is the address of a pointer to the real destination.
        const INDIRECT_POINTER = 1 << 4;
        /// Block has been attributed to a recovered function.
        const FUNCTION = 1 << 5;
    }
}

pub struct BasicBlock {
    /// Address of the first instruction.
    pub start: u64,
    /// Address one past the last instruction.
    pub end: u64,
    /// Branch or call target, meaning depends on the flags.
    pub target: u64,
    flags: AtomicU32,
}

impl BasicBlock {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            target: 0,
            flags: AtomicU32::new(0),
        }
    }

    /// Builder used by block producers to record how the block terminates.
    pub fn with_exit(mut self, flags: BlockFlags, target: u64) -> Self {
        self.target = target;
        *self.flags.get_mut() |= flags.bits();
        self
    }

    pub fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    pub fn has_flag(&self, flag: BlockFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Set `flag` without requiring exclusive access.
    pub fn set_flag(&self, flag: BlockFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    /// Inclusive on both ends so a block also "contains" the address
    /// immediately after its last instruction.
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address <= self.end
    }
}

impl Clone for BasicBlock {
    fn clone(&self) -> Self {
        Self {
            start: self.start,
            end: self.end,
            target: self.target,
            flags: AtomicU32::new(self.flags.load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Debug for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicBlock")
            .field("start", &format_args!("0x{:x}", self.start))
            .field("end", &format_args!("0x{:x}", self.end))
            .field("target", &format_args!("0x{:x}", self.target))
            .field("flags", &self.flags())
            .finish()
    }
}

/// Index of the block containing `address`, by binary search over `blocks`.
///
/// `blocks` must be sorted by start address and non-overlapping. When the
/// address sits on the boundary between two adjacent blocks, the block that
/// starts there is returned.
pub fn find_block_in_range(blocks: &[BasicBlock], address: u64) -> Option<usize> {
    let after = blocks.partition_point(|block| block.start <= address);
    let index = after.checked_sub(1)?;
    blocks[index].contains(address).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks() -> Vec<BasicBlock> {
        vec![
            BasicBlock::new(0x1000, 0x1010),
            BasicBlock::new(0x1010, 0x1030),
            BasicBlock::new(0x1040, 0x1048),
        ]
    }

    #[test]
    fn test_find_block_in_range() {
        let blocks = blocks();

        assert_eq!(find_block_in_range(&blocks, 0x1000), Some(0));
        assert_eq!(find_block_in_range(&blocks, 0x100f), Some(0));
        // shared boundary resolves to the block starting there
        assert_eq!(find_block_in_range(&blocks, 0x1010), Some(1));
        assert_eq!(find_block_in_range(&blocks, 0x1030), Some(1));
        assert_eq!(find_block_in_range(&blocks, 0x1048), Some(2));

        // gaps and out of range
        assert_eq!(find_block_in_range(&blocks, 0x0fff), None);
        assert_eq!(find_block_in_range(&blocks, 0x1038), None);
        assert_eq!(find_block_in_range(&blocks, 0x1049), None);
        assert_eq!(find_block_in_range(&[], 0x1000), None);
    }

    #[test]
    fn test_flags_through_shared_reference() {
        let block = BasicBlock::new(0x1000, 0x1005).with_exit(BlockFlags::CALL, 0x2000);
        let shared = &block;

        assert!(shared.has_flag(BlockFlags::CALL));
        assert!(!shared.has_flag(BlockFlags::FUNCTION));

        shared.set_flag(BlockFlags::FUNCTION);
        shared.set_flag(BlockFlags::FUNCTION);

        assert_eq!(block.flags(), BlockFlags::CALL | BlockFlags::FUNCTION);
        assert_eq!(block.target, 0x2000);

        let copy = block.clone();
        assert_eq!(copy.flags(), block.flags());
    }
}

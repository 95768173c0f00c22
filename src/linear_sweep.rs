//! Linear-sweep basic block builder for [`ImageDebuggee`].
//!
//! Every initialized executable byte in the range is decoded in order. A block ends after
//! any instruction that does not simply fall through, and its exit is
//! classified into [`BlockFlags`] the way the function pass expects.

use crate::block::{BasicBlock, BlockFlags};
use crate::image::ImageDebuggee;
use anyhow::{Context, Result};
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, OpKind, Register};
use std::ops::Range;
use tracing::debug;

/// Decode the executable parts of `range` into blocks sorted by start address.
pub fn build_blocks(image: &ImageDebuggee, range: Range<u64>) -> Result<Vec<BasicBlock>> {
    let mut blocks = Vec::new();

    for section in image.executable_sections() {
        let data = image
            .section_data(section)
            .with_context(|| format!("Section {} extends past end of file", section.name))?;

        // only the initialized part of the section is decoded
        let section_start = section.virtual_range.start;
        let start = section_start.max(range.start);
        let end = (section_start + data.len() as u64).min(range.end);
        if start >= end {
            continue;
        }

        let bytes = &data[(start - section_start) as usize..(end - section_start) as usize];

        let before = blocks.len();
        sweep(image.bitness(), bytes, start, &mut blocks);
        debug!(
            section = %section.name,
            blocks = blocks.len() - before,
            "Swept section"
        );
    }

    blocks.sort_by_key(|block| block.start);
    Ok(blocks)
}

/// Decode `bytes` loaded at `address` and append the blocks found to `blocks`.
pub fn sweep(bitness: u32, bytes: &[u8], address: u64, blocks: &mut Vec<BasicBlock>) {
    let mut decoder = Decoder::with_ip(bitness, bytes, address, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut block_start = None;

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let ip = instruction.ip();

        if instruction.is_invalid() {
            if let Some(start) = block_start.take() {
                blocks.push(BasicBlock::new(start, ip));
            }
            continue;
        }

        let start = *block_start.get_or_insert(ip);
        let (flags, target) = match instruction.flow_control() {
            FlowControl::Next => continue,
            FlowControl::Call => match get_branch_target(&instruction) {
                Some(target) => (BlockFlags::CALL, target),
                None => (BlockFlags::INDIRECT, 0),
            },
            FlowControl::IndirectCall => match call_pointer(&instruction) {
                Some(pointer) => (BlockFlags::CALL | BlockFlags::INDIRECT_POINTER, pointer),
                None => (BlockFlags::INDIRECT, 0),
            },
            FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch => {
                match get_branch_target(&instruction) {
                    Some(target) => (BlockFlags::JMP, target),
                    None => (BlockFlags::JMP | BlockFlags::INDIRECT, 0),
                }
            }
            FlowControl::IndirectBranch => (BlockFlags::JMP | BlockFlags::INDIRECT, 0),
            FlowControl::Return => (BlockFlags::RET, 0),
            _ => (BlockFlags::empty(), 0),
        };

        blocks.push(BasicBlock::new(start, instruction.next_ip()).with_exit(flags, target));
        block_start = None;
    }

    if let Some(start) = block_start {
        blocks.push(BasicBlock::new(start, decoder.ip()));
    }
}

fn get_branch_target(instruction: &Instruction) -> Option<u64> {
    match instruction.op_kind(0) {
        OpKind::NearBranch16 => Some(instruction.near_branch16() as u64),
        OpKind::NearBranch32 => Some(instruction.near_branch32() as u64),
        OpKind::NearBranch64 => Some(instruction.near_branch64()),
        _ => None,
    }
}

/// Location of the pointer read by `call [mem]`, if it is a fixed address.
fn call_pointer(instruction: &Instruction) -> Option<u64> {
    if instruction.op_kind(0) != OpKind::Memory {
        return None;
    }
    if instruction.is_ip_rel_memory_operand() {
        return Some(instruction.ip_rel_memory_address());
    }
    (instruction.memory_base() == Register::None && instruction.memory_index() == Register::None)
        .then(|| instruction.memory_displacement64())
}

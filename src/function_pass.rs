//! Recover function boundaries over a range of basic blocks.
//!
//! Two sources of evidence are combined:
//!
//! 1. the module's exception directory, which lists the exact extent of every
//!    function that needs unwind data, and
//! 2. call instructions, whose targets are taken as function entry points.
//!    Calls through a pointer (`call [rip+x]`) are followed by reading the
//!    pointer out of the live process.
//!
//! The block list is cut into one contiguous chunk per worker. Each worker
//! collects candidates for its chunk into its own vector; the vectors are
//! merged after all workers have joined, deduplicated, and handed to the
//! debuggee's function registry.
//!
//! Call targets are only known by their entry point. They are registered with
//! `end == start`, so the registry receives an inverted `(start, start - 1)`
//! range for them; finding their real end is not attempted here.

use crate::block::{BasicBlock, BlockFlags, find_block_in_range};
use crate::debuggee::Debuggee;
use crate::pass::{AnalysisPass, PassConfig, partition};
use crate::progress::{NoOpProgressReporter, ProgressReporter};
use crate::runtime_table::FunctionTable;
use rayon::prelude::*;
use std::ops::{ControlFlow, Range};
use tracing::{debug, trace, warn};

/// A function candidate.
///
/// Ordering compares all four fields, so two candidates with the same address
/// range but different block indices are distinct.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FunctionDef {
    pub start: u64,
    /// Exclusive end. Equal to `start` while unknown.
    pub end: u64,
    pub block_start: usize,
    pub block_end: usize,
}

impl FunctionDef {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            block_start: 0,
            block_end: 0,
        }
    }
}

/// Sort ascending and drop adjacent duplicates.
pub fn sort_dedup(functions: &mut Vec<FunctionDef>) {
    functions.sort_unstable();
    functions.dedup();
}

pub struct FunctionPass<'a, D: Debuggee + ?Sized> {
    range: Range<u64>,
    blocks: &'a [BasicBlock],
    debuggee: &'a D,
    table: FunctionTable,
    config: PassConfig,
}

impl<'a, D: Debuggee + ?Sized> FunctionPass<'a, D> {
    /// `blocks` must be sorted by address and non-overlapping.
    pub fn new(virtual_start: u64, virtual_end: u64, blocks: &'a [BasicBlock], debuggee: &'a D) -> Self {
        Self::with_config(virtual_start, virtual_end, blocks, debuggee, PassConfig::default())
    }

    pub fn with_config(
        virtual_start: u64,
        virtual_end: u64,
        blocks: &'a [BasicBlock],
        debuggee: &'a D,
        config: PassConfig,
    ) -> Self {
        // only populated when the range lies inside a loaded module
        let table = FunctionTable::load(debuggee, virtual_start);

        Self {
            range: virtual_start..virtual_end,
            blocks,
            debuggee,
            table,
            config,
        }
    }

    pub fn function_table(&self) -> &FunctionTable {
        &self.table
    }

    pub fn config(&self) -> &PassConfig {
        &self.config
    }

    /// Is `address` within the analyzed range?
    pub fn validate_address(&self, address: u64) -> bool {
        self.range.contains(&address)
    }

    /// Run the pass, reporting one progress step per finished chunk.
    pub fn analyze_with_progress<P: ProgressReporter>(&self, progress: &P) -> bool {
        let chunks = partition(self.blocks.len(), self.config.thread_count());
        progress.initialize(chunks.len() as u64);

        let results = self.run_chunks(&chunks, progress);
        progress.finish();

        let mut functions: Vec<FunctionDef> = results.into_iter().flatten().collect();
        sort_dedup(&mut functions);

        debug!(
            threads = chunks.len(),
            blocks = self.blocks.len(),
            functions = functions.len(),
            "Function analysis complete"
        );

        self.debuggee.clear_all_functions();
        for function in &functions {
            self.debuggee
                .add_function(function.start, function.end.wrapping_sub(1), true);
        }
        self.debuggee.refresh_views();

        true
    }

    fn run_chunks<P: ProgressReporter>(
        &self,
        chunks: &[Range<usize>],
        progress: &P,
    ) -> Vec<Vec<FunctionDef>> {
        let work = |chunk: &Range<usize>| {
            let functions = self.analyze_chunk(chunk.clone());
            progress.progress();
            functions
        };

        match rayon::ThreadPoolBuilder::new()
            .num_threads(chunks.len())
            .build()
        {
            Ok(pool) => pool.install(|| chunks.par_iter().map(work).collect()),
            Err(e) => {
                warn!("Failed to build worker pool, analyzing serially: {e}");
                chunks.iter().map(work).collect()
            }
        }
    }

    /// Collect and resolve the function candidates of one chunk of blocks.
    pub fn analyze_chunk(&self, range: Range<usize>) -> Vec<FunctionDef> {
        let total = self.blocks.len();
        let range = range.start.min(total)..range.end.min(total);
        if range.is_empty() {
            return Vec::new();
        }

        let mut functions = Vec::with_capacity(self.config.worker_capacity);

        self.prepass(range.clone(), &mut functions);
        self.scan_call_targets(range.clone(), &mut functions);
        sort_dedup(&mut functions);
        self.resolve_function_ends(&mut functions);

        debug!(
            chunk = format!("{}..{}", range.start, range.end),
            functions = functions.len(),
            "Total detected functions"
        );

        functions
    }

    /// Seed candidates from runtime functions starting inside the chunk.
    fn prepass(&self, range: Range<usize>, functions: &mut Vec<FunctionDef>) {
        let min_address = self.blocks[range.start].start;
        let max_address = self.blocks[range.end - 1].end;

        self.table.enumerate(|entry| {
            if entry.range.start >= min_address && entry.range.start < max_address {
                functions.push(FunctionDef::new(entry.range.start, entry.range.end));
            }
            ControlFlow::Continue(())
        });
    }

    fn scan_call_targets(&self, range: Range<usize>, functions: &mut Vec<FunctionDef>) {
        for block in &self.blocks[range] {
            if !block.has_flag(BlockFlags::CALL) {
                continue;
            }

            let Some(destination) = self.call_destination(block) else {
                continue;
            };

            if !self.validate_address(destination) {
                trace!(
                    block = format!("0x{:x}", block.start),
                    destination = format!("0x{destination:x}"),
                    "Call target outside analysis range"
                );
                continue;
            }

            functions.push(FunctionDef::new(destination, destination));
        }
    }

    /// Where the call at the end of `block` lands, following one level of
    /// indirection for calls through a pointer.
    fn call_destination(&self, block: &BasicBlock) -> Option<u64> {
        if !block.has_flag(BlockFlags::INDIRECT_POINTER) {
            return Some(block.target);
        }

        let pointer_size = self.config.pointer_size;
        let mut buf = [0u8; 8];
        let buf = &mut buf[..pointer_size.bytes()];

        if let Err(e) = self.debuggee.read_memory(block.target, buf) {
            trace!(
                pointer = format!("0x{:x}", block.target),
                "Unreadable call pointer: {e}"
            );
            return None;
        }

        let destination = pointer_size.read(buf);
        if !self.debuggee.is_valid_read_ptr(destination) {
            trace!(
                pointer = format!("0x{:x}", block.target),
                destination = format!("0x{destination:x}"),
                "Call pointer does not point to readable memory"
            );
            return None;
        }

        debug!(
            pointer = format!("0x{:x}", block.target),
            destination = format!("0x{destination:x}"),
            "Indirect pointer"
        );

        Some(destination)
    }

    fn resolve_function_ends(&self, functions: &mut [FunctionDef]) {
        for function in functions.iter_mut() {
            // call targets only carry an entry point
            if function.end == 0 || function.end == function.start {
                continue;
            }

            if !self.resolve_known_end(function) {
                trace!(
                    start = format!("0x{:x}", function.start),
                    end = format!("0x{:x}", function.end),
                    "No blocks for function range"
                );
            }
        }
    }

    /// Attach the block index range of `function` and mark those blocks as
    /// belonging to a function. Returns `false` if either end is not inside a
    /// block.
    pub fn resolve_known_end(&self, function: &mut FunctionDef) -> bool {
        let (Some(first), Some(last)) = (
            find_block_in_range(self.blocks, function.start),
            find_block_in_range(self.blocks, function.end),
        ) else {
            return false;
        };

        function.block_start = first;
        function.block_end = last;

        for block in self.blocks.get(first..last).unwrap_or_default() {
            block.set_flag(BlockFlags::FUNCTION);
        }

        true
    }
}

impl<D: Debuggee + ?Sized> AnalysisPass for FunctionPass<'_, D> {
    fn name(&self) -> &'static str {
        "Function Analysis"
    }

    fn analyze(&mut self) -> bool {
        self.analyze_with_progress(&NoOpProgressReporter)
    }
}

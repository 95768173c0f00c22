use anyhow::{Result, bail};
use byteorder::{ByteOrder, LE};
use std::ops::Range;

/// An analysis step run over a range of already decoded basic blocks.
pub trait AnalysisPass {
    fn name(&self) -> &'static str;

    /// Run the pass. Returns `true` when the pass completed.
    fn analyze(&mut self) -> bool;
}

/// Width of a pointer in the analyzed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointerSize {
    Bits32,
    #[default]
    Bits64,
}

impl PointerSize {
    pub fn from_bitness(bitness: u32) -> Result<Self> {
        match bitness {
            32 => Ok(Self::Bits32),
            64 => Ok(Self::Bits64),
            _ => bail!("Unsupported bitness {bitness}"),
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }

    /// Decode a little-endian pointer; `bytes` must be at least `self.bytes()` long.
    pub fn read(self, bytes: &[u8]) -> u64 {
        match self {
            Self::Bits32 => LE::read_u32(bytes) as u64,
            Self::Bits64 => LE::read_u64(bytes),
        }
    }
}

/// Tuning knobs for [`crate::FunctionPass`].
#[derive(Debug, Clone)]
pub struct PassConfig {
    /// Worker count; `None` uses the runtime's ideal parallelism.
    pub threads: Option<usize>,
    pub pointer_size: PointerSize,
    /// Candidates reserved up front per worker. Zero conserves memory.
    pub worker_capacity: usize,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            threads: None,
            pointer_size: PointerSize::default(),
            worker_capacity: 10_000,
        }
    }
}

impl PassConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_pointer_size(mut self, pointer_size: PointerSize) -> Self {
        self.pointer_size = pointer_size;
        self
    }

    pub fn conserve_memory(mut self) -> Self {
        self.worker_capacity = 0;
        self
    }

    /// Number of workers to spawn, always at least one.
    pub fn thread_count(&self) -> usize {
        self.threads
            .unwrap_or_else(rayon::current_num_threads)
            .max(1)
    }
}

/// Split `total` block indices into exactly `threads` contiguous, disjoint
/// half-open ranges of at most `ceil(total / threads)` indices each.
///
/// Trailing ranges are empty when there are fewer blocks than threads.
pub fn partition(total: usize, threads: usize) -> Vec<Range<usize>> {
    let threads = threads.max(1);
    let workload = total.div_ceil(threads);

    (0..threads)
        .map(|i| {
            let start = (workload * i).min(total);
            let end = (start + workload).min(total);
            start..end
        })
        .collect()
}

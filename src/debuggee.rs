//! Interfaces the function pass needs from the debugger hosting it.

use anyhow::Result;
use std::path::PathBuf;

/// Lookup of loaded modules in the debuggee.
pub trait ModuleResolver {
    /// Load base of the module containing `address`, if any.
    fn module_base_for_address(&self, address: u64) -> Option<u64>;

    /// On-disk path of the module loaded at `base`.
    fn module_path_for_base(&self, base: u64) -> Option<PathBuf>;
}

/// Access to the debuggee's live address space.
///
/// The debuggee may keep running while it is analyzed, so values read through
/// this trait are snapshots and can be stale by the time they are used.
pub trait ProcessMemory {
    /// Fill `buf` from `address`. Partial reads are errors.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    fn is_valid_read_ptr(&self, address: u64) -> bool;
}

/// Sink for recovered functions. Implementations synchronize internally.
pub trait FunctionRegistry {
    fn clear_all_functions(&self);

    /// `end` is inclusive.
    fn add_function(&self, start: u64, end: u64, user_defined: bool);
}

/// Fire-and-forget notification that displayed data changed.
pub trait ViewObserver {
    fn refresh_views(&self);
}

/// Everything a pass needs from its host, shareable across analysis workers.
pub trait Debuggee: ModuleResolver + ProcessMemory + FunctionRegistry + ViewObserver + Sync {}

impl<T> Debuggee for T where T: ModuleResolver + ProcessMemory + FunctionRegistry + ViewObserver + Sync {}

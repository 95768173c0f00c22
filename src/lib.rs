//! Function boundary recovery for disassembled binaries
//!
//! Given the basic blocks of a code range, [`FunctionPass`] combines two
//! sources of function starts, the module's x64 exception directory and the
//! targets of call instructions, and registers the result with a debuggee's
//! function database. The work is split across a rayon thread pool.
//!
//! The debuggee is abstracted behind the traits in [`debuggee`]; a PE file on
//! disk can stand in for a live process via [`ImageDebuggee`], with blocks
//! produced by [`linear_sweep::build_blocks`].

pub mod block;
pub mod debuggee;
pub mod function_pass;
pub mod image;
pub mod linear_sweep;
pub mod pass;
pub mod progress;
pub mod runtime_table;


pub use anyhow;

pub use block::{BasicBlock, BlockFlags, find_block_in_range};
pub use debuggee::{Debuggee, FunctionRegistry, ModuleResolver, ProcessMemory, ViewObserver};
pub use function_pass::{FunctionDef, FunctionPass};
pub use image::{ImageDebuggee, RegisteredFunction};
pub use pass::{AnalysisPass, PassConfig, PointerSize};
pub use progress::{
    IndicatifProgressBar, NoOpProgressReporter, ProgressReporter, default_progress_style,
};
pub use runtime_table::{FunctionTable, RuntimeFunction};

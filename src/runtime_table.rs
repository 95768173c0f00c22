//! The x64 exception directory, used as a source of known function extents.
//!
//! The directory is a packed array of `RUNTIME_FUNCTION` records, each holding
//! the begin, end and unwind-info RVAs of one function:
//!
//! ```text
//! +0  BeginAddress       u32  RVA of the first byte of the function
//! +4  EndAddress         u32  RVA one past the last byte
//! +8  UnwindInfoAddress  u32  RVA of the UNWIND_INFO
//! ```
//!
//! The loader only uses the on-disk image to find where the table lives. The
//! table itself is copied out of the live process, since that is the memory
//! the rest of the analysis sees.

use crate::debuggee::{ModuleResolver, ProcessMemory};
use anyhow::{Context, Result, bail};
use byteorder::{ByteOrder, LE};
use memmap2::Mmap;
use object::pe::{IMAGE_DIRECTORY_ENTRY_EXCEPTION, ImageNtHeaders32, ImageNtHeaders64};
use object::read::pe::{ImageNtHeaders, PeFile};
use std::fs::File;
use std::ops::{ControlFlow, Range};
use std::path::Path;
use tracing::{debug, warn};

pub const RUNTIME_FUNCTION_SIZE: usize = 12;

/// A `RUNTIME_FUNCTION` record as stored in the image, module relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRuntimeFunction {
    pub begin_address: u32,
    pub end_address: u32,
    pub unwind_info_address: u32,
}

impl RawRuntimeFunction {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RUNTIME_FUNCTION_SIZE {
            bail!(
                "RUNTIME_FUNCTION needs {} bytes, got {}",
                RUNTIME_FUNCTION_SIZE,
                bytes.len()
            );
        }

        Ok(Self {
            begin_address: LE::read_u32(&bytes[0..4]),
            end_address: LE::read_u32(&bytes[4..8]),
            unwind_info_address: LE::read_u32(&bytes[8..12]),
        })
    }

    pub fn to_absolute(self, module_base: u64) -> RuntimeFunction {
        let va = |rva: u32| module_base.wrapping_add(rva as u64);
        RuntimeFunction {
            range: va(self.begin_address)..va(self.end_address),
            unwind: va(self.unwind_info_address),
        }
    }
}

/// A runtime function with absolute virtual addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub range: Range<u64>,
    pub unwind: u64,
}

/// Owned copy of a module's exception directory.
///
/// An empty table is a valid state: the analyzed range may not belong to any
/// module, or the module may simply not carry unwind data.
#[derive(Debug, Default)]
pub struct FunctionTable {
    module_base: u64,
    data: Vec<u8>,
}

impl FunctionTable {
    pub fn from_bytes(module_base: u64, data: Vec<u8>) -> Self {
        Self { module_base, data }
    }

    /// Load the exception directory of the module containing `address`.
    ///
    /// Never fails; every problem along the way leaves the table empty.
    pub fn load<D>(debuggee: &D, address: u64) -> Self
    where
        D: ModuleResolver + ProcessMemory + ?Sized,
    {
        let Some(module_base) = debuggee.module_base_for_address(address) else {
            debug!(
                address = format!("0x{address:x}"),
                "Address is not inside a module, no function table"
            );
            return Self::default();
        };

        match Self::try_load(debuggee, module_base) {
            Ok(table) => {
                debug!(
                    module_base = format!("0x{module_base:x}"),
                    entries = table.len(),
                    "Loaded function table"
                );
                table
            }
            Err(e) => {
                warn!(
                    module_base = format!("0x{module_base:x}"),
                    "Failed to load function table: {e:#}"
                );
                Self::default()
            }
        }
    }

    fn try_load<D>(debuggee: &D, module_base: u64) -> Result<Self>
    where
        D: ModuleResolver + ProcessMemory + ?Sized,
    {
        let path = debuggee
            .module_path_for_base(module_base)
            .with_context(|| format!("No path for module at 0x{module_base:x}"))?;

        let Some((offset, size)) = exception_directory(&path)? else {
            return Ok(Self::from_bytes(module_base, Vec::new()));
        };

        let size = size as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .with_context(|| format!("Failed to allocate 0x{size:x} bytes for function table"))?;
        data.resize(size, 0);

        let address = module_base
            .checked_add(offset as u64)
            .with_context(|| format!("Function table at 0x{module_base:x} + 0x{offset:x} overflows"))?;
        debuggee
            .read_memory(address, &mut data)
            .with_context(|| format!("Failed to read function table at 0x{address:x}"))?;

        Ok(Self::from_bytes(module_base, data))
    }

    pub fn module_base(&self) -> u64 {
        self.module_base
    }

    /// Number of complete records; trailing bytes are ignored.
    pub fn len(&self) -> usize {
        self.data.len() / RUNTIME_FUNCTION_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily decode the records in table order.
    pub fn entries(&self) -> impl Iterator<Item = RuntimeFunction> + '_ {
        self.data
            .chunks_exact(RUNTIME_FUNCTION_SIZE)
            .filter_map(|record| RawRuntimeFunction::parse(record).ok())
            .map(|raw| raw.to_absolute(self.module_base))
    }

    /// Visit records in table order until the visitor breaks.
    pub fn enumerate<F>(&self, mut visitor: F)
    where
        F: FnMut(&RuntimeFunction) -> ControlFlow<()>,
    {
        let _ = self.entries().try_for_each(|entry| visitor(&entry));
    }
}

/// (RVA, size) of the exception directory of the image at `path`.
///
/// The mapping only lives for the duration of this call.
fn exception_directory(path: &Path) -> Result<Option<(u32, u32)>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open module image {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to map module image {}", path.display()))?;

    let directory = match exception_directory_for::<ImageNtHeaders64>(&mmap) {
        Ok(directory) => directory,
        Err(_) => exception_directory_for::<ImageNtHeaders32>(&mmap)
            .with_context(|| format!("Not a PE image: {}", path.display()))?,
    };

    Ok(directory.filter(|&(offset, _)| offset != 0))
}

fn exception_directory_for<Pe: ImageNtHeaders>(data: &[u8]) -> Result<Option<(u32, u32)>> {
    let pe_file = PeFile::<Pe>::parse(data)?;
    Ok(pe_file
        .data_directory(IMAGE_DIRECTORY_ENTRY_EXCEPTION)
        .map(|directory| directory.address_range()))
}

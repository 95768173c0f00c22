//! A PE file on disk standing in for a running process.
//!
//! The image is treated as if it were loaded at its preferred base with every
//! section mapped, which is enough to run the function pass without a live
//! debuggee. Recovered functions are collected in memory.

use crate::debuggee::{FunctionRegistry, ModuleResolver, ProcessMemory, ViewObserver};
use crate::pass::PointerSize;
use anyhow::{Context, Result, bail};
use memmap2::Mmap;
use object::LittleEndian as LE;
use object::pe::{IMAGE_SCN_MEM_EXECUTE, ImageNtHeaders32, ImageNtHeaders64};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader, PeFile};
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_range: Range<u64>,
    pub file_offset: usize,
    pub raw_size: usize,
    pub executable: bool,
}

/// A function as handed to the registry; `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredFunction {
    pub start: u64,
    pub end: u64,
    pub user_defined: bool,
}

pub struct ImageDebuggee {
    path: PathBuf,
    mmap: Mmap,
    image_base: u64,
    image_range: Range<u64>,
    headers_range: Range<u64>,
    bitness: u32,
    sections: Vec<Section>,
    functions: Mutex<Vec<RegisteredFunction>>,
    refreshes: AtomicUsize,
}

struct Layout {
    image_base: u64,
    image_range: Range<u64>,
    headers_range: Range<u64>,
    sections: Vec<Section>,
}

impl ImageDebuggee {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open PE file: {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };

        let (layout, bitness) = if PeFile::<ImageNtHeaders64>::parse(&*mmap).is_ok() {
            (parse_layout::<ImageNtHeaders64>(&mmap), 64)
        } else {
            (parse_layout::<ImageNtHeaders32>(&mmap), 32)
        };
        let layout =
            layout.with_context(|| format!("Failed to parse PE file: {}", path.display()))?;

        debug!(
            image_base = format!("0x{:x}", layout.image_base),
            sections = layout.sections.len(),
            bitness,
            "Loaded image"
        );

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            image_base: layout.image_base,
            image_range: layout.image_range,
            headers_range: layout.headers_range,
            bitness,
            sections: layout.sections,
            functions: Mutex::new(Vec::new()),
            refreshes: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    pub fn pointer_size(&self) -> PointerSize {
        match self.bitness {
            32 => PointerSize::Bits32,
            _ => PointerSize::Bits64,
        }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn executable_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|section| section.executable)
    }

    /// Span from the first to the last byte of executable code.
    pub fn code_range(&self) -> Option<Range<u64>> {
        let start = self.executable_sections().map(|s| s.virtual_range.start).min()?;
        let end = self.executable_sections().map(|s| s.virtual_range.end).max()?;
        Some(start..end)
    }

    /// Read bytes at a virtual address. The read must stay within the headers
    /// or a single section; bytes past a section's raw data read as zero.
    pub fn read_at_va(&self, va: u64, buf: &mut [u8]) -> Result<()> {
        let end = va
            .checked_add(buf.len() as u64)
            .with_context(|| format!("Read at 0x{va:x} overflows"))?;

        if va >= self.headers_range.start && end <= self.headers_range.end {
            let offset = (va - self.image_base) as usize;
            let src = self
                .mmap
                .get(offset..offset + buf.len())
                .context("Read would go past end of file")?;
            buf.copy_from_slice(src);
            return Ok(());
        }

        let Some(section) = self
            .sections
            .iter()
            .find(|s| s.virtual_range.start <= va && end <= s.virtual_range.end)
        else {
            bail!("VA range 0x{:x}..0x{:x} not found in any section", va, end);
        };

        let offset = (va - section.virtual_range.start) as usize;
        buf.fill(0);
        if offset < section.raw_size {
            let available = (section.raw_size - offset).min(buf.len());
            let start = section.file_offset + offset;
            let src = self
                .mmap
                .get(start..start + available)
                .context("Read would go past end of file")?;
            buf[..available].copy_from_slice(src);
        }

        Ok(())
    }

    /// Initialized bytes of `section` as stored in the file.
    pub fn section_data(&self, section: &Section) -> Option<&[u8]> {
        let end = section.file_offset.checked_add(section.raw_size)?;
        self.mmap.get(section.file_offset..end)
    }

    /// Functions registered by the last pass, in registration order.
    pub fn functions(&self) -> Vec<RegisteredFunction> {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }
}

/// `base + offset` spanning `size` bytes, or an error if it does not fit the
/// address space.
fn va_range(base: u64, offset: u64, size: u64) -> Result<Range<u64>> {
    let start = base
        .checked_add(offset)
        .with_context(|| format!("Address 0x{base:x} + 0x{offset:x} overflows"))?;
    let end = start
        .checked_add(size)
        .with_context(|| format!("Range at 0x{start:x} of size 0x{size:x} overflows"))?;
    Ok(start..end)
}

fn parse_layout<Pe: ImageNtHeaders>(data: &[u8]) -> Result<Layout> {
    let pe_file = PeFile::<Pe>::parse(data)?;
    let optional_header = pe_file.nt_headers().optional_header();
    let image_base = optional_header.image_base();

    let sections = pe_file
        .section_table()
        .iter()
        .map(|header| -> Result<Section> {
            let name = String::from_utf8_lossy(header.raw_name()).into_owned();
            let rva = header.virtual_address.get(LE) as u64;
            let raw_size = header.size_of_raw_data.get(LE);
            let size = header.virtual_size.get(LE).max(raw_size) as u64;
            let virtual_range = va_range(image_base, rva, size)
                .with_context(|| format!("Section {name} does not fit the address space"))?;

            Ok(Section {
                name,
                virtual_range,
                file_offset: header.pointer_to_raw_data.get(LE) as usize,
                raw_size: raw_size as usize,
                executable: header.characteristics.get(LE) & IMAGE_SCN_MEM_EXECUTE != 0,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Layout {
        image_base,
        image_range: va_range(image_base, 0, optional_header.size_of_image() as u64)?,
        headers_range: va_range(image_base, 0, optional_header.size_of_headers() as u64)?,
        sections,
    })
}

impl ModuleResolver for ImageDebuggee {
    fn module_base_for_address(&self, address: u64) -> Option<u64> {
        self.image_range
            .contains(&address)
            .then_some(self.image_base)
    }

    fn module_path_for_base(&self, base: u64) -> Option<PathBuf> {
        (base == self.image_base).then(|| self.path.clone())
    }
}

impl ProcessMemory for ImageDebuggee {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.read_at_va(address, buf)
    }

    fn is_valid_read_ptr(&self, address: u64) -> bool {
        self.headers_range.contains(&address)
            || self
                .sections
                .iter()
                .any(|section| section.virtual_range.contains(&address))
    }
}

impl FunctionRegistry for ImageDebuggee {
    fn clear_all_functions(&self) {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn add_function(&self, start: u64, end: u64, user_defined: bool) {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RegisteredFunction {
                start,
                end,
                user_defined,
            });
    }
}

impl ViewObserver for ImageDebuggee {
    fn refresh_views(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!("Views refreshed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{SCN_CODE, SCN_RDATA, TestSection, pe64_image, write_image};

    const BASE: u64 = 0x140000000;

    fn sample() -> Vec<u8> {
        pe64_image(
            BASE,
            None,
            &[
                TestSection {
                    name: ".text",
                    rva: 0x1000,
                    data: vec![0xc3; 0x10],
                    characteristics: SCN_CODE,
                },
                TestSection {
                    name: ".rdata",
                    rva: 0x2000,
                    data: (0u8..0x20).collect(),
                    characteristics: SCN_RDATA,
                },
            ],
        )
    }

    #[test]
    fn test_load_layout() {
        let file = write_image(&sample());
        let image = ImageDebuggee::load(file.path()).unwrap();

        assert_eq!(image.image_base(), BASE);
        assert_eq!(image.bitness(), 64);
        assert_eq!(image.pointer_size(), PointerSize::Bits64);

        let names: Vec<_> = image.sections().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![".text", ".rdata"]);

        let code: Vec<_> = image.executable_sections().map(|s| s.name.as_str()).collect();
        assert_eq!(code, vec![".text"]);
        // virtual size is rounded up to the raw size
        assert_eq!(image.code_range(), Some(BASE + 0x1000..BASE + 0x1200));
    }

    #[test]
    fn test_read_at_va() {
        let file = write_image(&sample());
        let image = ImageDebuggee::load(file.path()).unwrap();

        let mut buf = [0u8; 4];
        image.read_at_va(BASE + 0x2004, &mut buf).unwrap();
        assert_eq!(buf, [4, 5, 6, 7]);

        // headers are readable
        image.read_at_va(BASE, &mut buf[..2]).unwrap();
        assert_eq!(&buf[..2], b"MZ");

        // past the initialized data but inside the section
        let mut buf = [0xffu8; 8];
        image.read_at_va(BASE + 0x2100, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);

        assert!(image.read_at_va(BASE + 0x1ffc, &mut [0u8; 8]).is_err());
        assert!(image.read_at_va(BASE + 0x8000, &mut [0u8; 1]).is_err());
        assert!(image.read_at_va(u64::MAX, &mut [0u8; 2]).is_err());
    }

    #[test]
    fn test_debuggee_interfaces() {
        let file = write_image(&sample());
        let image = ImageDebuggee::load(file.path()).unwrap();

        assert_eq!(image.module_base_for_address(BASE + 0x1004), Some(BASE));
        assert_eq!(image.module_base_for_address(BASE + 0x10000), None);
        assert_eq!(image.module_path_for_base(BASE), Some(file.path().to_path_buf()));
        assert_eq!(image.module_path_for_base(BASE + 1), None);

        assert!(image.is_valid_read_ptr(BASE + 0x1000));
        assert!(image.is_valid_read_ptr(BASE + 0x21ff));
        assert!(!image.is_valid_read_ptr(BASE + 0x2200));
        assert!(!image.is_valid_read_ptr(0x1234));

        image.add_function(BASE + 0x1000, BASE + 0x100f, true);
        image.clear_all_functions();
        image.add_function(BASE + 0x1004, BASE + 0x1007, true);
        image.refresh_views();

        assert_eq!(
            image.functions(),
            vec![RegisteredFunction {
                start: BASE + 0x1004,
                end: BASE + 0x1007,
                user_defined: true,
            }]
        );
        assert_eq!(image.refresh_count(), 1);
    }

    #[test]
    fn test_load_rejects_image_past_address_space() {
        let image = pe64_image(
            0xffff_ffff_ffff_f000,
            None,
            &[TestSection {
                name: ".text",
                rva: 0x1000,
                data: vec![0xc3; 0x10],
                characteristics: SCN_CODE,
            }],
        );
        let file = write_image(&image);

        let err = ImageDebuggee::load(file.path()).err().unwrap();
        assert!(format!("{err:#}").contains("overflows"));
    }

    #[test]
    fn test_section_data() {
        let file = write_image(&sample());
        let image = ImageDebuggee::load(file.path()).unwrap();

        let rdata = &image.sections()[1];
        let data = image.section_data(rdata).unwrap();
        assert_eq!(data.len(), 0x200);
        assert_eq!(&data[..4], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let file = write_image(&[0u8; 64]);
        assert!(ImageDebuggee::load(file.path()).is_err());
        assert!(ImageDebuggee::load("/nonexistent/image.exe").is_err());
    }
}

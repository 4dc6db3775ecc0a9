//! ELF image view.
//!
//! Only what the rewrite pipeline consumes: the raw bytes, the code section
//! geometry (mutable, so `--start`/`--end` can trim it), the dynamic symbol
//! table for position resolution, and the first free virtual address past
//! the loaded segments (the callee allocator builds on it).

use crate::result::{Error, Result};
use goblin::elf::{header, program_header, Elf};
use regex::Regex;
use std::fs;
use std::sync::OnceLock;

/// Page granularity of the loader and the callee allocator.
pub const PAGE_SIZE: u64 = 4096;

/// A parsed x86_64 ELF executable or shared object.
pub struct Image {
    /// Path the image was read from.
    pub path: String,
    /// Entire file contents.
    pub data: Vec<u8>,
    /// True for `ET_DYN` files.
    pub dso: bool,
    /// Load base the image was placed at (0 for the input binary).
    pub base: u64,
    /// File offset of the code section.
    pub text_offset: u64,
    /// Virtual address of the code section.
    pub text_addr: u64,
    /// Size of the code section in bytes.
    pub text_size: u64,
    /// Page-aligned end of the loaded segments, relative to the file's own
    /// address space.
    pub size: u64,
    /// First free page-aligned virtual address past the image (`base` +
    /// [`Image::size`]).
    pub free_addr: u64,
    dynsyms: Vec<(String, u64)>,
}

impl Image {
    /// Reads and parses `path`, placing the image at `base`.
    pub fn parse(path: &str, base: u64) -> Result<Image> {
        let data = fs::read(path).map_err(|e| Error::FileRead {
            path: path.to_string(),
            source: e,
        })?;
        let elf = Elf::parse(&data).map_err(|e| Error::Elf {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        if elf.header.e_machine != header::EM_X86_64 {
            return Err(Error::Elf {
                path: path.to_string(),
                message: format!("unsupported machine type {}", elf.header.e_machine),
            });
        }
        let dso = elf.header.e_type == header::ET_DYN;

        let mut text = None;
        for sh in &elf.section_headers {
            if elf.shdr_strtab.get_at(sh.sh_name) == Some(".text") {
                text = Some((sh.sh_offset, sh.sh_addr, sh.sh_size));
                break;
            }
        }
        let (text_offset, text_addr, text_size) = text.ok_or_else(|| Error::Elf {
            path: path.to_string(),
            message: "no (.text) section".into(),
        })?;

        let mut dynsyms = Vec::new();
        for sym in elf.dynsyms.iter() {
            if sym.st_name == 0 {
                continue;
            }
            if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
                dynsyms.push((name.to_string(), sym.st_value));
            }
        }

        let mut end = 0u64;
        for ph in &elf.program_headers {
            if ph.p_type == program_header::PT_LOAD {
                end = end.max(ph.p_vaddr + ph.p_memsz);
            }
        }
        let size = align_up(end, PAGE_SIZE);

        tracing::debug!(
            "parsed ELF '{}': dso={}, .text 0x{:x}..0x{:x}",
            path,
            dso,
            text_addr,
            text_addr + text_size
        );
        Ok(Image {
            path: path.to_string(),
            data,
            dso,
            base,
            text_offset,
            text_addr,
            text_size,
            size,
            free_addr: base + size,
            dynsyms,
        })
    }

    /// The (possibly trimmed) code section bytes.
    pub fn text_bytes(&self) -> &[u8] {
        let start = self.text_offset as usize;
        &self.data[start..start + self.text_size as usize]
    }

    /// Address of a dynamic symbol, if present.
    pub fn lookup_dynsym(&self, name: &str) -> Option<u64> {
        self.dynsyms
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, addr)| addr)
    }

    /// Resolves a `--start`/`--end` position: an absolute `0x...` address or
    /// a dynamic symbol whose address must lie inside the code section.
    pub fn position_to_addr(&self, option: &'static str, pos: &str) -> Result<u64> {
        if let Some(hex) = pos.strip_prefix("0x") {
            return u64::from_str_radix(hex, 16).map_err(|_| Error::Position {
                option,
                message: format!("invalid absolute position string \"{pos}\""),
            });
        }
        let addr = self.lookup_dynsym(pos).ok_or_else(|| Error::Position {
            option,
            message: format!("failed to find dynamic symbol \"{pos}\""),
        })?;
        if addr < self.text_addr || addr >= self.text_addr + self.text_size {
            return Err(Error::Position {
                option,
                message: format!("dynamic symbol \"{pos}\" points outside of the (.text) section"),
            });
        }
        Ok(addr)
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Shared-object filename convention: `[PATH/]lib*.so[.VERSION]`.
pub fn is_library_filename(path: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:.*/)?lib[^/]*\.so(?:\.\d+)*$").unwrap())
        .is_match(path)
}

//! Executable container parsing.
//!
//! Builds an editable in-memory view of the three container families the
//! patch pipeline understands: PE (`MZ`/`PE\0\0`), Mach-O (thin and fat,
//! plus the legacy PEF container used by very old Mac builds) and ELF.
//!
//! Parsing is read-only validation: section tables must lie within the
//! file and must not overlap. Malformed or truncated input fails with
//! [`Error::MalformedImage`] rather than panicking or reading out of
//! bounds. The raw buffer is owned by the image and mutated in place by
//! the downstream patchers; one image never outlives one build.

use goblin::elf::section_header::{SHF_EXECINSTR, SHT_NOBITS};
use goblin::elf::Elf;
use goblin::mach::header::Header as MachHeader;
use goblin::mach::load_command::{LC_MAIN, LC_SEGMENT, LC_SEGMENT_64};
use goblin::mach::parse_magic_and_ctx;
use scroll::ctx::SizeWith;
use scroll::{Pread, BE, LE};

use crate::error::{Error, Result};

// Mach-O CPU types; goblin keeps these behind per-arch modules, so spell
// out the ones the variant table actually covers.
const CPU_TYPE_I386: u32 = 0x0000_0007;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const CPU_TYPE_POWERPC: u32 = 0x0000_0012;
const CPU_TYPE_POWERPC64: u32 = 0x0100_0012;
const CPU_SUBTYPE_POWERPC_970: u32 = 100;

const FAT_MAGIC: u32 = 0xcafe_babe;
const PEF_TAG: &[u8; 8] = b"Joy!peff";

/// Container format of a parsed executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pe,
    MachO,
    /// Classic Mac OS Preferred Executable Format (resource-fork era).
    Pef,
    Elf,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Format::Pe => "pe",
            Format::MachO => "macho",
            Format::Pef => "pef",
            Format::Elf => "elf",
        })
    }
}

/// CPU architecture tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    I386,
    X86_64,
    Ppc,
    Ppc64,
    /// PowerPC G5, distinguished because some player builds shipped
    /// 970-only code paths.
    Ppc970,
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Arch::I386 => "i386",
            Arch::X86_64 => "x86_64",
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64",
            Arch::Ppc970 => "ppc970",
        })
    }
}

/// A section or segment byte range within the file.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub file_offset: usize,
    pub size: usize,
    pub executable: bool,
}

impl Section {
    fn end(&self) -> usize {
        self.file_offset + self.size
    }
}

/// PE header bookkeeping needed by the resource and signature patchers.
#[derive(Debug, Clone)]
pub(crate) struct PeLayout {
    /// File offset of the `PE\0\0` signature.
    pub pe_offset: usize,
    /// File offset of the optional header.
    pub optional_offset: usize,
    /// Optional-header magic: 0x10b (PE32) or 0x20b (PE32+).
    pub optional_magic: u16,
    /// File offset of the section table.
    pub section_table_offset: usize,
    pub number_of_sections: usize,
}

impl PeLayout {
    /// File offset of data directory `index` (8 bytes: VA, size).
    pub fn data_directory_offset(&self, index: usize) -> usize {
        let dirs_base = if self.optional_magic == 0x20b { 112 } else { 96 };
        self.optional_offset + dirs_base + index * 8
    }
}

/// A vendor executable loaded into memory together with its parsed view.
///
/// Owned exclusively by one build; patch steps mutate the buffer in place
/// and the assembler serializes it back out.
#[derive(Debug)]
pub struct ExecutableImage {
    data: Vec<u8>,
    pub format: Format,
    pub arch: Arch,
    pub entry: u64,
    sections: Vec<Section>,
    /// For fat Mach-O input: file offset of the selected thin slice.
    pub(crate) macho_base: usize,
    pub(crate) pe: Option<PeLayout>,
}

impl ExecutableImage {
    /// Parse a raw executable, taking ownership of its bytes.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() >= 8 && &data[..8] == PEF_TAG {
            return Self::parse_pef(data);
        }
        match data.get(..4) {
            Some([0x7f, b'E', b'L', b'F']) => Self::parse_elf(data),
            Some([b'M', b'Z', ..]) => Self::parse_pe(data),
            Some(magic4) => {
                let be: u32 = magic4
                    .pread_with(0, BE)
                    .map_err(|_| Error::malformed("file shorter than a magic number"))?;
                if be == FAT_MAGIC {
                    let base = Self::select_fat_slice(&data)?;
                    Self::parse_macho(data, base)
                } else if parse_magic_and_ctx(&data, 0)
                    .map(|(_, ctx)| ctx.is_some())
                    .unwrap_or(false)
                {
                    Self::parse_macho(data, 0)
                } else {
                    Err(Error::malformed("unrecognized executable magic"))
                }
            }
            None => Err(Error::malformed("file shorter than a magic number")),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Byte range of a named section, without copying.
    pub fn section_bytes(&self, name: &str) -> Option<&[u8]> {
        let s = self.section(name)?;
        self.data.get(s.file_offset..s.end())
    }

    /// Sections that carry machine code, in file order.
    pub fn code_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.executable && s.size > 0)
    }

    /// Truncate the file tail. Used by the signature handler when a
    /// signature blob is the last thing in the file.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        for s in &mut self.sections {
            if s.end() > len {
                s.size = len.saturating_sub(s.file_offset.min(len));
                s.file_offset = s.file_offset.min(len);
            }
        }
    }

    /// Grow the file tail by `extra` zero bytes, returning the old length.
    pub(crate) fn grow(&mut self, extra: usize) -> usize {
        let old = self.data.len();
        self.data.resize(old + extra, 0);
        old
    }

    fn finish(
        data: Vec<u8>,
        format: Format,
        arch: Arch,
        entry: u64,
        sections: Vec<Section>,
        macho_base: usize,
        pe: Option<PeLayout>,
    ) -> Result<Self> {
        check_section_table(&sections, data.len())?;
        Ok(ExecutableImage {
            data,
            format,
            arch,
            entry,
            sections,
            macho_base,
            pe,
        })
    }

    // ---------------------------------------------------------------- ELF

    fn parse_elf(data: Vec<u8>) -> Result<Self> {
        let elf = Elf::parse(&data).map_err(Error::malformed)?;

        let arch = match elf.header.e_machine {
            goblin::elf::header::EM_386 => Arch::I386,
            goblin::elf::header::EM_X86_64 => Arch::X86_64,
            goblin::elf::header::EM_PPC => Arch::Ppc,
            goblin::elf::header::EM_PPC64 => Arch::Ppc64,
            other => {
                return Err(Error::malformed(format!(
                    "unsupported ELF machine 0x{other:x}"
                )))
            }
        };

        let mut sections = Vec::with_capacity(elf.section_headers.len());
        for (i, shdr) in elf.section_headers.iter().enumerate() {
            if i == 0 || shdr.sh_type == SHT_NOBITS || shdr.sh_size == 0 {
                continue;
            }
            let name = elf
                .shdr_strtab
                .get_at(shdr.sh_name)
                .unwrap_or("")
                .to_string();
            sections.push(Section {
                name,
                file_offset: shdr.sh_offset as usize,
                size: shdr.sh_size as usize,
                executable: shdr.sh_flags & u64::from(SHF_EXECINSTR) != 0,
            });
        }

        let entry = elf.header.e_entry;
        Self::finish(data, Format::Elf, arch, entry, sections, 0, None)
    }

    // ----------------------------------------------------------------- PE

    fn parse_pe(data: Vec<u8>) -> Result<Self> {
        let read_u16 = |off: usize| -> Result<u16> {
            data.pread_with(off, LE)
                .map_err(|_| Error::malformed("PE header truncated"))
        };
        let read_u32 = |off: usize| -> Result<u32> {
            data.pread_with(off, LE)
                .map_err(|_| Error::malformed("PE header truncated"))
        };

        let pe_offset = read_u32(0x3c)? as usize;
        if data.get(pe_offset..pe_offset + 4) != Some(b"PE\0\0") {
            return Err(Error::malformed("missing PE\\0\\0 signature"));
        }

        let coff = pe_offset + 4;
        let machine = read_u16(coff)?;
        let number_of_sections = read_u16(coff + 2)? as usize;
        let size_of_optional = read_u16(coff + 16)? as usize;
        let optional_offset = coff + 20;
        if size_of_optional < 96 {
            return Err(Error::malformed("optional header too small"));
        }

        let optional_magic = read_u16(optional_offset)?;
        if optional_magic != 0x10b && optional_magic != 0x20b {
            return Err(Error::malformed(format!(
                "unknown optional-header magic 0x{optional_magic:x}"
            )));
        }
        let entry = u64::from(read_u32(optional_offset + 16)?);

        let arch = match machine {
            0x014c => Arch::I386,
            0x8664 => Arch::X86_64,
            other => {
                return Err(Error::malformed(format!(
                    "unsupported PE machine 0x{other:x}"
                )))
            }
        };

        let section_table_offset = optional_offset + size_of_optional;
        let mut sections = Vec::with_capacity(number_of_sections);
        for i in 0..number_of_sections {
            let base = section_table_offset + i * 40;
            let name_bytes = data
                .get(base..base + 8)
                .ok_or_else(|| Error::malformed("section table truncated"))?;
            let name = String::from_utf8_lossy(name_bytes)
                .trim_end_matches('\0')
                .to_string();
            let size_of_raw = read_u32(base + 16)? as usize;
            let pointer_to_raw = read_u32(base + 20)? as usize;
            let characteristics = read_u32(base + 36)?;
            if size_of_raw == 0 {
                continue;
            }
            sections.push(Section {
                name,
                file_offset: pointer_to_raw,
                size: size_of_raw,
                // IMAGE_SCN_MEM_EXECUTE
                executable: characteristics & 0x2000_0000 != 0,
            });
        }

        let pe = PeLayout {
            pe_offset,
            optional_offset,
            optional_magic,
            section_table_offset,
            number_of_sections,
        };
        Self::finish(data, Format::Pe, arch, entry, sections, 0, Some(pe))
    }

    /// Map a resource-section RVA to a file offset using the section table.
    pub(crate) fn pe_rva_to_offset(&self, rva: u32) -> Result<usize> {
        let pe = self
            .pe
            .as_ref()
            .ok_or_else(|| Error::malformed("not a PE image"))?;
        for i in 0..pe.number_of_sections {
            let base = pe.section_table_offset + i * 40;
            let virtual_size: u32 = self
                .data
                .pread_with(base + 8, LE)
                .map_err(|_| Error::malformed("section table truncated"))?;
            let virtual_address: u32 = self
                .data
                .pread_with(base + 12, LE)
                .map_err(|_| Error::malformed("section table truncated"))?;
            let size_of_raw: u32 = self
                .data
                .pread_with(base + 16, LE)
                .map_err(|_| Error::malformed("section table truncated"))?;
            let pointer_to_raw: u32 = self
                .data
                .pread_with(base + 20, LE)
                .map_err(|_| Error::malformed("section table truncated"))?;
            let span = virtual_size.max(size_of_raw);
            let end = virtual_address
                .checked_add(span)
                .ok_or_else(|| Error::malformed("section virtual range overflows"))?;
            if rva >= virtual_address && rva < end {
                return Ok((rva - virtual_address + pointer_to_raw) as usize);
            }
        }
        Err(Error::malformed(format!("RVA 0x{rva:x} maps to no section")))
    }

    // ------------------------------------------------------------- Mach-O

    fn select_fat_slice(data: &[u8]) -> Result<usize> {
        let nfat: u32 = data
            .pread_with(4, BE)
            .map_err(|_| Error::malformed("fat header truncated"))?;
        if nfat == 0 || nfat > 16 {
            return Err(Error::malformed(format!("implausible fat arch count {nfat}")));
        }
        // One slice per build: take the first one whose offsets are sane.
        for i in 0..nfat as usize {
            let base = 8 + i * 20;
            let offset: u32 = data
                .pread_with(base + 8, BE)
                .map_err(|_| Error::malformed("fat arch table truncated"))?;
            let size: u32 = data
                .pread_with(base + 12, BE)
                .map_err(|_| Error::malformed("fat arch table truncated"))?;
            let end = offset as usize + size as usize;
            if end <= data.len() && size > 0 {
                return Ok(offset as usize);
            }
        }
        Err(Error::malformed("fat container holds no usable slice"))
    }

    fn parse_macho(data: Vec<u8>, base: usize) -> Result<Self> {
        let slice = data
            .get(base..)
            .ok_or_else(|| Error::malformed("fat slice offset beyond file"))?;
        let (_, ctx_opt) = parse_magic_and_ctx(slice, 0).map_err(Error::malformed)?;
        let ctx = ctx_opt.ok_or_else(|| Error::malformed("invalid Mach-O magic"))?;
        let header: MachHeader = slice.pread_with(0, ctx).map_err(Error::malformed)?;
        let header_size = MachHeader::size_with(&ctx);

        let arch = match (header.cputype, header.cpusubtype & 0x00ff_ffff) {
            (CPU_TYPE_I386, _) => Arch::I386,
            (CPU_TYPE_X86_64, _) => Arch::X86_64,
            (CPU_TYPE_POWERPC, CPU_SUBTYPE_POWERPC_970) => Arch::Ppc970,
            (CPU_TYPE_POWERPC, _) => Arch::Ppc,
            (CPU_TYPE_POWERPC64, _) => Arch::Ppc64,
            (other, _) => {
                return Err(Error::malformed(format!(
                    "unsupported Mach-O cputype 0x{other:x}"
                )))
            }
        };

        let mut sections = Vec::new();
        let mut entry = 0u64;
        let mut offset = header_size;
        for _ in 0..header.ncmds {
            let cmd: u32 = slice.pread_with(offset, ctx.le).map_err(Error::malformed)?;
            let cmdsize: u32 = slice
                .pread_with(offset + 4, ctx.le)
                .map_err(Error::malformed)?;
            if cmdsize < 8 || offset + cmdsize as usize > slice.len() {
                return Err(Error::malformed("load command exceeds file"));
            }

            let name_at = |start: usize| -> Result<&str> {
                slice
                    .get(start..start + 16)
                    .map(segment_name)
                    .ok_or_else(|| Error::malformed("load command truncated"))
            };

            match cmd {
                LC_SEGMENT_64 => {
                    let segname = name_at(offset + 8)?;
                    let executable = segname == "__TEXT";
                    let nsects: u32 = slice
                        .pread_with(offset + 64, ctx.le)
                        .map_err(Error::malformed)?;
                    let mut sect = offset + 72;
                    for _ in 0..nsects {
                        let sectname = name_at(sect)?;
                        let size: u64 =
                            slice.pread_with(sect + 40, ctx.le).map_err(Error::malformed)?;
                        let fileoff: u32 =
                            slice.pread_with(sect + 48, ctx.le).map_err(Error::malformed)?;
                        if size > 0 && fileoff > 0 {
                            sections.push(Section {
                                name: format!("{segname},{sectname}"),
                                file_offset: base + fileoff as usize,
                                size: size as usize,
                                executable,
                            });
                        }
                        sect += 80;
                    }
                }
                LC_SEGMENT => {
                    let segname = name_at(offset + 8)?;
                    let executable = segname == "__TEXT";
                    let nsects: u32 = slice
                        .pread_with(offset + 48, ctx.le)
                        .map_err(Error::malformed)?;
                    let mut sect = offset + 56;
                    for _ in 0..nsects {
                        let sectname = name_at(sect)?;
                        let size: u32 =
                            slice.pread_with(sect + 36, ctx.le).map_err(Error::malformed)?;
                        let fileoff: u32 =
                            slice.pread_with(sect + 40, ctx.le).map_err(Error::malformed)?;
                        if size > 0 && fileoff > 0 {
                            sections.push(Section {
                                name: format!("{segname},{sectname}"),
                                file_offset: base + fileoff as usize,
                                size: size as usize,
                                executable,
                            });
                        }
                        sect += 68;
                    }
                }
                LC_MAIN => {
                    entry = slice
                        .pread_with(offset + 8, ctx.le)
                        .map_err(Error::malformed)?;
                }
                _ => {}
            }

            offset += cmdsize as usize;
        }

        Self::finish(data, Format::MachO, arch, entry, sections, base, None)
    }

    // --------------------------------------------------------------- PEF

    fn parse_pef(data: Vec<u8>) -> Result<Self> {
        // PEF container header is 40 bytes, big-endian throughout.
        if data.len() < 40 {
            return Err(Error::malformed("PEF header truncated"));
        }
        let arch = match &data[8..12] {
            b"pwpc" => Arch::Ppc,
            b"m68k" => {
                return Err(Error::malformed("m68k PEF containers are not supported"))
            }
            other => {
                return Err(Error::malformed(format!(
                    "unknown PEF architecture tag {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        let section_count: u16 = data
            .pread_with(32, BE)
            .map_err(|_| Error::malformed("PEF header truncated"))?;
        let mut sections = Vec::with_capacity(section_count as usize);
        for i in 0..section_count as usize {
            let base = 40 + i * 28;
            let container_length: u32 = data
                .pread_with(base + 16, BE)
                .map_err(|_| Error::malformed("PEF section table truncated"))?;
            let container_offset: u32 = data
                .pread_with(base + 20, BE)
                .map_err(|_| Error::malformed("PEF section table truncated"))?;
            let kind = *data
                .get(base + 24)
                .ok_or_else(|| Error::malformed("PEF section table truncated"))?;
            if container_length == 0 {
                continue;
            }
            let name = match kind {
                0 => "code",
                1 => "data",
                2 => "pattern-data",
                3 => "constant",
                4 => "loader",
                _ => "misc",
            };
            sections.push(Section {
                name: format!("{name}.{i}"),
                file_offset: container_offset as usize,
                size: container_length as usize,
                executable: kind == 0,
            });
        }

        Self::finish(data, Format::Pef, arch, 0, sections, 0, None)
    }
}

fn segment_name(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes)
        .unwrap_or("")
        .trim_end_matches('\0')
}

/// Reject section tables that point outside the file or overlap.
fn check_section_table(sections: &[Section], file_len: usize) -> Result<()> {
    for s in sections {
        let end = s
            .file_offset
            .checked_add(s.size)
            .ok_or_else(|| Error::malformed("section range overflows"))?;
        if end > file_len {
            return Err(Error::malformed(format!(
                "section {:?} [{:#x}..{:#x}) extends beyond file ({:#x} bytes)",
                s.name, s.file_offset, end, file_len
            )));
        }
    }

    let mut ranges: Vec<(usize, usize, &str)> = sections
        .iter()
        .map(|s| (s.file_offset, s.end(), s.name.as_str()))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(Error::malformed(format!(
                "sections {:?} and {:?} overlap",
                pair[0].2, pair[1].2
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_input() {
        assert!(matches!(
            ExecutableImage::parse(vec![0x7f, b'E']),
            Err(Error::MalformedImage(_))
        ));
    }

    #[test]
    fn rejects_unknown_magic() {
        assert!(matches!(
            ExecutableImage::parse(vec![0u8; 64]),
            Err(Error::MalformedImage(_))
        ));
    }

    #[test]
    fn overlap_check_catches_bad_tables() {
        let sections = vec![
            Section {
                name: ".a".into(),
                file_offset: 0x100,
                size: 0x100,
                executable: false,
            },
            Section {
                name: ".b".into(),
                file_offset: 0x180,
                size: 0x80,
                executable: false,
            },
        ];
        assert!(check_section_table(&sections, 0x1000).is_err());
    }

    #[test]
    fn bounds_check_catches_truncation() {
        let sections = vec![Section {
            name: ".a".into(),
            file_offset: 0x100,
            size: 0x100,
            executable: false,
        }];
        assert!(check_section_table(&sections, 0x180).is_err());
        assert!(check_section_table(&sections, 0x200).is_ok());
    }

    #[test]
    fn segment_name_trims_padding() {
        assert_eq!(segment_name(b"__TEXT\0\0\0\0\0\0\0\0\0\0"), "__TEXT");
    }

    /// Minimal PE32 with one section at the given virtual address.
    fn tiny_pe(section_va: u32, virtual_size: u32) -> Vec<u8> {
        let mut f = vec![0u8; 0x110];
        let put16 = |f: &mut [u8], at: usize, v: u16| f[at..at + 2].copy_from_slice(&v.to_le_bytes());
        let put32 = |f: &mut [u8], at: usize, v: u32| f[at..at + 4].copy_from_slice(&v.to_le_bytes());
        f[0] = b'M';
        f[1] = b'Z';
        put32(&mut f, 0x3c, 0x40);
        f[0x40..0x44].copy_from_slice(b"PE\0\0");
        put16(&mut f, 0x44, 0x014c);
        put16(&mut f, 0x46, 1); // one section
        put16(&mut f, 0x54, 96); // optional header size
        put16(&mut f, 0x58, 0x10b);
        // Section table at 0x58 + 96 = 0xB8.
        f[0xB8..0xBA].copy_from_slice(b".x");
        put32(&mut f, 0xB8 + 8, virtual_size);
        put32(&mut f, 0xB8 + 12, section_va);
        put32(&mut f, 0xB8 + 16, 0x10); // raw size
        put32(&mut f, 0xB8 + 20, 0x100); // raw pointer
        f
    }

    #[test]
    fn rva_mapping_rejects_overflowing_section_span() {
        let image = ExecutableImage::parse(tiny_pe(0xffff_fff0, 0x100)).unwrap();
        assert!(matches!(
            image.pe_rva_to_offset(0x1000),
            Err(Error::MalformedImage(_))
        ));
    }

    #[test]
    fn rva_mapping_resolves_within_section() {
        let image = ExecutableImage::parse(tiny_pe(0x1000, 0x10)).unwrap();
        assert_eq!(image.pe_rva_to_offset(0x1004).unwrap(), 0x104);
        assert!(image.pe_rva_to_offset(0x2000).is_err());
    }
}

//! Synthetic player fixtures.
//!
//! Minimal but structurally honest binaries, one per container family,
//! laid out to match rows of the variant table: the confirming version
//! string sits at the table's offset and (for code-patch variants) the
//! title pattern occurs exactly once in a code section.

#![allow(dead_code)]

use projector_forge::variants::{PatchRecipe, Variant, VARIANTS};
use projector_forge::{Arch, BytePattern, Platform};

pub fn put16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn put32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn put64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

pub fn put16_be(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

pub fn put32_be(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

pub fn find_variant(platform: Platform, arch: Arch, version: &str) -> &'static Variant {
    VARIANTS
        .iter()
        .find(|v| {
            v.fingerprint.platform == platform
                && v.fingerprint.arch == arch
                && v.fingerprint.version == version
        })
        .expect("variant table row")
}

pub fn code_pattern(variant: &Variant) -> BytePattern {
    match &variant.recipe {
        PatchRecipe::CodePatch(cp) => cp.pattern,
        PatchRecipe::ResourceEdit(_) => panic!("variant is not a code-patch recipe"),
    }
}

/// Write a pattern occurrence: exact bytes where the mask demands them,
/// 0xAA at wildcard positions to prove wildcards really are ignored.
pub fn place_pattern(buf: &mut [u8], at: usize, pattern: &BytePattern) {
    for (i, (b, m)) in pattern.bytes.iter().zip(pattern.mask).enumerate() {
        buf[at + i] = if *m == 0 { 0xAA } else { *b };
    }
}

// ---------------------------------------------------------------------------
// ELF32 i386, linux 9.0.115.0 (code-patch variant)
// ---------------------------------------------------------------------------

pub fn elf32_player() -> Vec<u8> {
    let mut f = vec![0u8; 0x320];
    f[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    f[4] = 1; // ELFCLASS32
    f[5] = 1; // little endian
    f[6] = 1; // EV_CURRENT
    put16(&mut f, 0x10, 2); // ET_EXEC
    put16(&mut f, 0x12, 3); // EM_386
    put32(&mut f, 0x14, 1);
    put32(&mut f, 0x18, 0x0804_8120); // e_entry
    put32(&mut f, 0x20, 0x280); // e_shoff
    put16(&mut f, 0x28, 52); // e_ehsize
    put16(&mut f, 0x2e, 40); // e_shentsize
    put16(&mut f, 0x30, 4); // e_shnum
    put16(&mut f, 0x32, 3); // e_shstrndx

    let variant = find_variant(Platform::Linux, Arch::I386, "9.0.115.0");
    place_pattern(&mut f, 0x120, &code_pattern(variant));
    f[0x210..0x219].copy_from_slice(b"9.0.115.0");
    f[0x240..0x259].copy_from_slice(b"\0.text\0.rodata\0.shstrtab\0");

    // name, type, flags, addr, offset, size
    let shdr = |f: &mut [u8], i: usize, name: u32, typ: u32, flags: u32, off: u32, size: u32| {
        let base = 0x280 + i * 40;
        put32(f, base, name);
        put32(f, base + 4, typ);
        put32(f, base + 8, flags);
        put32(f, base + 12, 0x0804_8000 + off);
        put32(f, base + 16, off);
        put32(f, base + 20, size);
        put32(f, base + 32, 4);
    };
    shdr(&mut f, 1, 1, 1, 0x6, 0x100, 0x100); // .text  alloc|exec
    shdr(&mut f, 2, 7, 1, 0x2, 0x200, 0x40); // .rodata
    shdr(&mut f, 3, 15, 3, 0x0, 0x240, 0x20); // .shstrtab
    f
}

// ---------------------------------------------------------------------------
// ELF64 x86_64, linux 11.2.202.644 (code-patch variant, reject policy)
// ---------------------------------------------------------------------------

pub fn elf64_player() -> Vec<u8> {
    let mut f = vec![0u8; 0x380];
    f[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    f[4] = 2; // ELFCLASS64
    f[5] = 1; // little endian
    f[6] = 1; // EV_CURRENT
    put16(&mut f, 0x10, 2); // ET_EXEC
    put16(&mut f, 0x12, 62); // EM_X86_64
    put32(&mut f, 0x14, 1);
    put64(&mut f, 0x18, 0x40_0120); // e_entry
    put64(&mut f, 0x28, 0x280); // e_shoff
    put16(&mut f, 0x34, 64); // e_ehsize
    put16(&mut f, 0x3a, 64); // e_shentsize
    put16(&mut f, 0x3c, 4); // e_shnum
    put16(&mut f, 0x3e, 3); // e_shstrndx

    let variant = find_variant(Platform::Linux, Arch::X86_64, "11.2.202.644");
    place_pattern(&mut f, 0x120, &code_pattern(variant));
    f[0x210..0x21c].copy_from_slice(b"11.2.202.644");
    f[0x240..0x259].copy_from_slice(b"\0.text\0.rodata\0.shstrtab\0");

    let shdr = |f: &mut [u8], i: usize, name: u32, typ: u32, flags: u64, off: u64, size: u64| {
        let base = 0x280 + i * 64;
        put32(f, base, name);
        put32(f, base + 4, typ);
        put64(f, base + 8, flags);
        put64(f, base + 16, 0x40_0000 + off);
        put64(f, base + 24, off);
        put64(f, base + 32, size);
        put64(f, base + 48, 16);
    };
    shdr(&mut f, 1, 1, 1, 0x6, 0x100, 0x100); // .text  alloc|exec
    shdr(&mut f, 2, 7, 1, 0x2, 0x200, 0x40); // .rodata
    shdr(&mut f, 3, 15, 3, 0x0, 0x240, 0x20); // .shstrtab
    f
}

// ---------------------------------------------------------------------------
// PE32 i386, windows 9.0.115.0 (unsigned, code-patch variant)
// ---------------------------------------------------------------------------

pub fn pe32_player() -> Vec<u8> {
    let mut f = vec![0u8; 0x600];
    f[0] = b'M';
    f[1] = b'Z';
    put32(&mut f, 0x3c, 0x80);
    f[0x80..0x84].copy_from_slice(b"PE\0\0");
    put16(&mut f, 0x84, 0x014c);
    put16(&mut f, 0x86, 1); // one section
    put16(&mut f, 0x94, 224); // optional header size
    put16(&mut f, 0x96, 0x0102);

    put16(&mut f, 0x98, 0x10b);
    put32(&mut f, 0x98 + 16, 0x1000); // entry
    put32(&mut f, 0x98 + 32, 0x1000); // section alignment
    put32(&mut f, 0x98 + 36, 0x200); // file alignment

    // Section table at 0x98 + 224 = 0x178.
    let base = 0x178;
    f[base..base + 5].copy_from_slice(b".text");
    put32(&mut f, base + 8, 0x200); // virtual size
    put32(&mut f, base + 12, 0x1000);
    put32(&mut f, base + 16, 0x200); // raw size
    put32(&mut f, base + 20, 0x400);
    put32(&mut f, base + 36, 0x6000_0020);

    f[0x420..0x429].copy_from_slice(b"9,0,115,0");
    let variant = find_variant(Platform::Windows, Arch::I386, "9.0.115.0");
    place_pattern(&mut f, 0x460, &code_pattern(variant));
    f
}

// ---------------------------------------------------------------------------
// PE32+ x86_64, windows 32.0.0.465 (signed, resource-edit variant)
// ---------------------------------------------------------------------------

const OPTIONAL: usize = 0x98;
const DATA_DIRS: usize = OPTIONAL + 112;
pub const PE_CERT_DIR: usize = DATA_DIRS + 4 * 8;
pub const PE_CERT_OFFSET: usize = 0x800;
const SECTION_TABLE: usize = OPTIONAL + 240;
const RSRC_RAW: usize = 0x600;
const RSRC_RVA: u32 = 0x2000;

pub fn pe64_player() -> Vec<u8> {
    let mut f = vec![0u8; 0x888];
    f[0] = b'M';
    f[1] = b'Z';
    put32(&mut f, 0x3c, 0x80);
    f[0x80..0x84].copy_from_slice(b"PE\0\0");
    put16(&mut f, 0x84, 0x8664);
    put16(&mut f, 0x86, 2); // two sections
    put16(&mut f, 0x94, 240); // optional header size
    put16(&mut f, 0x96, 0x0022);

    put16(&mut f, OPTIONAL, 0x20b);
    put32(&mut f, OPTIONAL + 16, 0x1000); // entry
    put32(&mut f, OPTIONAL + 32, 0x1000); // section alignment
    put32(&mut f, OPTIONAL + 36, 0x200); // file alignment
    put32(&mut f, OPTIONAL + 56, 0x3000); // SizeOfImage
    put32(&mut f, OPTIONAL + 64, 0x0001_2345); // CheckSum (stale)
    put32(&mut f, OPTIONAL + 108, 16); // NumberOfRvaAndSizes
    put32(&mut f, DATA_DIRS + 2 * 8, RSRC_RVA); // resource directory
    put32(&mut f, DATA_DIRS + 2 * 8 + 4, 0x200);
    put32(&mut f, PE_CERT_DIR, PE_CERT_OFFSET as u32); // certificate table
    put32(&mut f, PE_CERT_DIR + 4, 0x88);

    let section = |f: &mut [u8], i: usize, name: &[u8], va: u32, raw: u32, chars: u32| {
        let base = SECTION_TABLE + i * 40;
        f[base..base + name.len()].copy_from_slice(name);
        put32(f, base + 8, 0x200); // virtual size
        put32(f, base + 12, va);
        put32(f, base + 16, 0x200); // raw size
        put32(f, base + 20, raw);
        put32(f, base + 36, chars);
    };
    section(&mut f, 0, b".text", 0x1000, 0x400, 0x6000_0020);
    section(&mut f, 1, b".rsrc", RSRC_RVA, RSRC_RAW as u32, 0x4000_0040);

    f[0x420..0x42a].copy_from_slice(b"32,0,0,465");
    build_rsrc(&mut f);

    // WIN_CERTIFICATE at the tail: length, revision 2.0, PKCS#7.
    put32(&mut f, PE_CERT_OFFSET, 0x88);
    put16(&mut f, PE_CERT_OFFSET + 4, 0x0200);
    put16(&mut f, PE_CERT_OFFSET + 6, 0x0002);
    f
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for u in s.encode_utf16() {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// RT_ICON(1) + RT_GROUP_ICON + RT_VERSION tree, offsets relative to 0x600.
fn build_rsrc(f: &mut Vec<u8>) {
    let r = RSRC_RAW;
    let dir = |f: &mut [u8], at: usize, entries: &[(u32, u32)]| {
        put16(f, r + at + 14, entries.len() as u16);
        for (i, (id, off)) in entries.iter().enumerate() {
            put32(f, r + at + 16 + i * 8, *id);
            put32(f, r + at + 16 + i * 8 + 4, *off);
        }
    };
    const SUB: u32 = 0x8000_0000;
    dir(f, 0x00, &[(3, 0x28 | SUB), (14, 0x58 | SUB), (16, 0x88 | SUB)]);
    dir(f, 0x28, &[(1, 0x40 | SUB)]); // icon id level
    dir(f, 0x40, &[(1033, 0xB8)]);
    dir(f, 0x58, &[(1, 0x70 | SUB)]); // group id level
    dir(f, 0x70, &[(1033, 0xC8)]);
    dir(f, 0x88, &[(1, 0xA0 | SUB)]); // version id level
    dir(f, 0xA0, &[(1033, 0xD8)]);

    let data_entry = |f: &mut [u8], at: usize, rel: u32, size: u32| {
        put32(f, r + at, RSRC_RVA + rel);
        put32(f, r + at + 4, size);
    };
    data_entry(f, 0xB8, 0xF0, 0x10);
    data_entry(f, 0xC8, 0x100, 20);
    data_entry(f, 0xD8, 0x120, 200);

    // Icon payload: one 16-byte image.
    for b in &mut f[r + 0xF0..r + 0x100] {
        *b = 0x11;
    }
    // GRPICONDIR: one member, id 1.
    put16(f, r + 0x102, 1); // type
    put16(f, r + 0x104, 1); // count
    f[r + 0x106..r + 0x10e].copy_from_slice(&[16, 16, 0, 0, 1, 0, 32, 0]);
    put32(f, r + 0x10e, 0x10); // bytes in resource
    put16(f, r + 0x112, 1); // member id

    // VS string blocks: ProductName (96 bytes), FileDescription (104).
    let string_block = |f: &mut [u8], at: usize, len: u16, key: &str, value: &str| {
        put16(f, r + at, len);
        put16(f, r + at + 2, (value.encode_utf16().count() + 1) as u16);
        put16(f, r + at + 4, 1);
        let key16 = utf16_bytes(key);
        f[r + at + 6..r + at + 6 + key16.len()].copy_from_slice(&key16);
        let value_at = (at + 6 + key16.len() + 3) & !3;
        let val16 = utf16_bytes(value);
        f[r + value_at..r + value_at + val16.len()].copy_from_slice(&val16);
    };
    string_block(f, 0x120, 96, "ProductName", "Adobe Flash Player 32");
    string_block(f, 0x180, 104, "FileDescription", "Adobe Flash Player 32.0");
}

// ---------------------------------------------------------------------------
// Mach-O x86_64, macos 32.0.0.371 (signed, resource-edit variant)
// ---------------------------------------------------------------------------

pub const MACHO_SIG_OFFSET: usize = 0x1000;

pub fn macho_player() -> Vec<u8> {
    let mut f = vec![0u8; 0x1100];
    put32(&mut f, 0, 0xfeed_facf); // MH_MAGIC_64
    put32(&mut f, 4, 0x0100_0007); // x86_64
    put32(&mut f, 8, 3);
    put32(&mut f, 12, 2); // MH_EXECUTE
    put32(&mut f, 16, 3); // ncmds
    put32(&mut f, 20, 240); // sizeofcmds

    // __TEXT with one section.
    let lc1 = 32;
    put32(&mut f, lc1, 0x19); // LC_SEGMENT_64
    put32(&mut f, lc1 + 4, 152);
    f[lc1 + 8..lc1 + 14].copy_from_slice(b"__TEXT");
    put64(&mut f, lc1 + 24, 0x1_0000_0000);
    put64(&mut f, lc1 + 32, 0x1000);
    put64(&mut f, lc1 + 40, 0); // fileoff
    put64(&mut f, lc1 + 48, 0x1000); // filesize
    put32(&mut f, lc1 + 64, 1); // nsects
    let sect = lc1 + 72;
    f[sect..sect + 6].copy_from_slice(b"__text");
    f[sect + 16..sect + 22].copy_from_slice(b"__TEXT");
    put64(&mut f, sect + 32, 0x1_0000_0500);
    put64(&mut f, sect + 40, 0x100); // size
    put32(&mut f, sect + 48, 0x500); // offset

    // __LINKEDIT holding the signature blob.
    let lc2 = lc1 + 152;
    put32(&mut f, lc2, 0x19);
    put32(&mut f, lc2 + 4, 72);
    f[lc2 + 8..lc2 + 18].copy_from_slice(b"__LINKEDIT");
    put64(&mut f, lc2 + 24, 0x1_0000_1000);
    put64(&mut f, lc2 + 32, 0x100);
    put64(&mut f, lc2 + 40, MACHO_SIG_OFFSET as u64);
    put64(&mut f, lc2 + 48, 0x100);

    // LC_CODE_SIGNATURE.
    let lc3 = lc2 + 72;
    put32(&mut f, lc3, 0x1d);
    put32(&mut f, lc3 + 4, 16);
    put32(&mut f, lc3 + 8, MACHO_SIG_OFFSET as u32);
    put32(&mut f, lc3 + 12, 0x100);

    f[0x520..0x52a].copy_from_slice(b"32,0,0,371");
    // Vendor signature stub: a SuperBlob magic at the blob start.
    put32_be(&mut f, MACHO_SIG_OFFSET, 0xfade_0cc0);
    f
}

// ---------------------------------------------------------------------------
// PEF ppc, macos 9.0.45.0 (code-patch variant)
// ---------------------------------------------------------------------------

pub fn pef_player() -> Vec<u8> {
    let mut f = vec![0u8; 0x160];
    f[..8].copy_from_slice(b"Joy!peff");
    f[8..12].copy_from_slice(b"pwpc");
    put16_be(&mut f, 32, 1); // section count
    put32_be(&mut f, 40 + 16, 0x100); // container length
    put32_be(&mut f, 40 + 20, 0x60); // container offset
    f[40 + 24] = 0; // kind: code

    let variant = find_variant(Platform::MacOS, Arch::Ppc, "9.0.45.0");
    place_pattern(&mut f, 0x70, &code_pattern(variant));
    f[0x100..0x108].copy_from_slice(b"9.0.45.0");
    f
}

// ---------------------------------------------------------------------------
// Icon containers
// ---------------------------------------------------------------------------

/// An `.ico` with the given image payload sizes (image i filled with i+1).
pub fn sample_ico(sizes: &[usize]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0, 0, 1, 0]);
    out.extend_from_slice(&(sizes.len() as u16).to_le_bytes());
    let mut offset = 6 + sizes.len() * 16;
    for &size in sizes {
        out.extend_from_slice(&[16, 16, 0, 0, 1, 0, 32, 0]);
        out.extend_from_slice(&(size as u32).to_le_bytes());
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += size;
    }
    for (i, &size) in sizes.iter().enumerate() {
        out.extend(std::iter::repeat(i as u8 + 1).take(size));
    }
    out
}

//! Code-signature neutralization and ad-hoc re-signing.
//!
//! Patched binaries no longer match their vendor signature, so the
//! signature must go before any bytes change. On PE that means dropping
//! the Authenticode certificate table and zeroing the header checksum.
//! On Mach-O the `LC_CODE_SIGNATURE` load command and its `__LINKEDIT`
//! blob are removed; after patching, a fresh ad-hoc signature is
//! generated so current macOS will still load the output.
//!
//! The ad-hoc signature is the minimal form the kernel accepts: a
//! SuperBlob holding a single SHA-256 CodeDirectory, no requirements, no
//! entitlements. That matches what `codesign -s -` produces for a plain
//! unsandboxed executable.

use goblin::mach::header::Header as MachHeader;
use goblin::mach::load_command::{LC_CODE_SIGNATURE, LC_SEGMENT, LC_SEGMENT_64};
use goblin::mach::parse_magic_and_ctx;
use log::{debug, info};
use scroll::ctx::{SizeWith, TryIntoCtx};
use scroll::{Endian, Pread, Pwrite, BE};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::image::{ExecutableImage, Format};

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;
const CSSLOT_CODEDIRECTORY: u32 = 0;
const CS_HASHTYPE_SHA256: u8 = 2;
const CS_ADHOC: u32 = 0x0002;
const CS_EXECSEG_MAIN_BINARY: u64 = 0x1;
const CS_PAGE_SIZE: usize = 4096;
const CS_PAGE_SIZE_LOG2: u8 = 12;
const CS_VERSION: u32 = 0x20400;

/// sizeof(linkedit_data_command)
const LC_CODE_SIGNATURE_SIZE: usize = 16;

/// Strip whatever vendor signature the image carries.
///
/// Returns `true` when a signature was present and removed. Unsigned
/// images (and PEF, which predates code signing) pass through untouched.
pub fn strip_signature(image: &mut ExecutableImage) -> Result<bool> {
    match image.format {
        Format::Pe => strip_pe_certificate(image),
        Format::MachO => strip_macho_signature(image),
        Format::Elf | Format::Pef => Ok(false),
    }
}

// ---------------------------------------------------------------------------
// PE / Authenticode
// ---------------------------------------------------------------------------

fn strip_pe_certificate(image: &mut ExecutableImage) -> Result<bool> {
    let pe = image
        .pe
        .as_ref()
        .ok_or_else(|| Error::malformed("not a PE image"))?
        .clone();
    // Data directory 4: the certificate table. Unlike every other entry
    // its first field is a file offset, not an RVA.
    let dir = pe.data_directory_offset(4);
    let cert_offset: u32 = image
        .bytes()
        .pread_with(dir, scroll::LE)
        .map_err(|_| Error::malformed("certificate data directory truncated"))?;
    let cert_size: u32 = image
        .bytes()
        .pread_with(dir + 4, scroll::LE)
        .map_err(|_| Error::malformed("certificate data directory truncated"))?;
    if cert_offset == 0 || cert_size == 0 {
        return Ok(false);
    }

    let start = cert_offset as usize;
    let end = start
        .checked_add(cert_size as usize)
        .ok_or_else(|| Error::SignatureStripFailure("certificate range overflows".into()))?;
    if end > image.len() || cert_size < 8 {
        return Err(Error::SignatureStripFailure(
            "certificate table lies outside the file".into(),
        ));
    }

    // WIN_CERTIFICATE sanity: known revision, PKCS#7 type. Anything else
    // is a sub-format this tool has never seen, so refuse to guess.
    let revision: u16 = image
        .bytes()
        .pread_with(start + 4, scroll::LE)
        .map_err(|_| Error::SignatureStripFailure("certificate header truncated".into()))?;
    let cert_type: u16 = image
        .bytes()
        .pread_with(start + 6, scroll::LE)
        .map_err(|_| Error::SignatureStripFailure("certificate header truncated".into()))?;
    if (revision != 0x0100 && revision != 0x0200) || cert_type != 0x0002 {
        return Err(Error::SignatureStripFailure(format!(
            "unrecognized WIN_CERTIFICATE revision {revision:#06x} type {cert_type:#06x}"
        )));
    }

    if end == image.len() {
        // The usual layout: the certificate is the last thing in the file.
        image.truncate(start);
        debug!("authenticode certificate truncated from file tail ({cert_size} bytes)");
    } else {
        // Embedded mid-file (overlay data follows). Keep offsets stable
        // and blank the region instead.
        for b in &mut image.bytes_mut()[start..end] {
            *b = 0;
        }
        debug!("authenticode certificate zeroed in place ({cert_size} bytes)");
    }

    let data = image.bytes_mut();
    data.pwrite_with(0u64, dir, scroll::LE)
        .map_err(|e| Error::malformed(e.to_string()))?;
    // The optional-header checksum covered the certificate; zero is valid
    // for non-driver images.
    data.pwrite_with(0u32, pe.optional_offset + 64, scroll::LE)
        .map_err(|e| Error::malformed(e.to_string()))?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Mach-O
// ---------------------------------------------------------------------------

/// Load-command bookkeeping shared by strip and re-sign.
struct MachLayout {
    ctx: goblin::container::Ctx,
    header_size: usize,
    ncmds: u32,
    sizeofcmds: u32,
    is_executable: bool,
    codesig: Option<CodesigCommand>,
    linkedit_cmd_offset: Option<usize>,
    linkedit_fileoff: u64,
    text_fileoff: u64,
    text_filesize: u64,
    /// Lowest file offset of any section payload; load commands must not
    /// grow past it.
    first_section_offset: usize,
}

struct CodesigCommand {
    cmd_offset: usize,
    data_offset: usize,
    data_size: usize,
}

fn read_mach_layout(data: &[u8]) -> Result<MachLayout> {
    let (_, ctx_opt) = parse_magic_and_ctx(data, 0).map_err(Error::malformed)?;
    let ctx = ctx_opt.ok_or_else(|| Error::malformed("invalid Mach-O magic"))?;
    let header: MachHeader = data.pread_with(0, ctx).map_err(Error::malformed)?;
    let header_size = MachHeader::size_with(&ctx);

    let mut layout = MachLayout {
        ctx,
        header_size,
        ncmds: header.ncmds as u32,
        sizeofcmds: header.sizeofcmds,
        is_executable: header.filetype == 2,
        codesig: None,
        linkedit_cmd_offset: None,
        linkedit_fileoff: 0,
        text_fileoff: 0,
        text_filesize: 0,
        first_section_offset: data.len(),
    };

    let mut offset = header_size;
    for _ in 0..header.ncmds {
        let cmd: u32 = data.pread_with(offset, ctx.le).map_err(Error::malformed)?;
        let cmdsize: u32 = data
            .pread_with(offset + 4, ctx.le)
            .map_err(Error::malformed)?;
        if cmdsize < 8 || offset + cmdsize as usize > data.len() {
            return Err(Error::malformed("load command exceeds file"));
        }

        match cmd {
            LC_CODE_SIGNATURE => {
                let data_offset: u32 = data
                    .pread_with(offset + 8, ctx.le)
                    .map_err(Error::malformed)?;
                let data_size: u32 = data
                    .pread_with(offset + 12, ctx.le)
                    .map_err(Error::malformed)?;
                layout.codesig = Some(CodesigCommand {
                    cmd_offset: offset,
                    data_offset: data_offset as usize,
                    data_size: data_size as usize,
                });
            }
            LC_SEGMENT_64 => {
                let name = data
                    .get(offset + 8..offset + 24)
                    .map(trimmed_name)
                    .ok_or_else(|| Error::malformed("load command truncated"))?;
                let fileoff: u64 = data
                    .pread_with(offset + 40, ctx.le)
                    .map_err(Error::malformed)?;
                let filesize: u64 = data
                    .pread_with(offset + 48, ctx.le)
                    .map_err(Error::malformed)?;
                match name {
                    "__LINKEDIT" => {
                        layout.linkedit_cmd_offset = Some(offset);
                        layout.linkedit_fileoff = fileoff;
                    }
                    "__TEXT" => {
                        layout.text_fileoff = fileoff;
                        layout.text_filesize = filesize;
                    }
                    _ => {}
                }
                if filesize > 0 && fileoff > 0 {
                    layout.first_section_offset =
                        layout.first_section_offset.min(fileoff as usize);
                }
            }
            LC_SEGMENT => {
                let name = data
                    .get(offset + 8..offset + 24)
                    .map(trimmed_name)
                    .ok_or_else(|| Error::malformed("load command truncated"))?;
                let fileoff: u32 = data
                    .pread_with(offset + 32, ctx.le)
                    .map_err(Error::malformed)?;
                let filesize: u32 = data
                    .pread_with(offset + 36, ctx.le)
                    .map_err(Error::malformed)?;
                match name {
                    "__LINKEDIT" => {
                        layout.linkedit_cmd_offset = Some(offset);
                        layout.linkedit_fileoff = u64::from(fileoff);
                    }
                    "__TEXT" => {
                        layout.text_fileoff = u64::from(fileoff);
                        layout.text_filesize = u64::from(filesize);
                    }
                    _ => {}
                }
                if filesize > 0 && fileoff > 0 {
                    layout.first_section_offset =
                        layout.first_section_offset.min(fileoff as usize);
                }
            }
            _ => {}
        }
        offset += cmdsize as usize;
    }

    Ok(layout)
}

fn trimmed_name(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).unwrap_or("").trim_end_matches('\0')
}

fn strip_macho_signature(image: &mut ExecutableImage) -> Result<bool> {
    if image.macho_base != 0 {
        return Err(Error::SignatureStripFailure(
            "cannot strip a slice embedded in a fat container".into(),
        ));
    }
    let layout = read_mach_layout(image.bytes())?;
    let Some(codesig) = layout.codesig else {
        return Ok(false);
    };

    let sig_end = codesig
        .data_offset
        .checked_add(codesig.data_size)
        .ok_or_else(|| Error::SignatureStripFailure("signature range overflows".into()))?;
    if sig_end != image.len() {
        // A signature blob that is not the file tail means something else
        // was appended after signing; removing it would corrupt that data.
        return Err(Error::SignatureStripFailure(
            "signature blob is not the last region in the file".into(),
        ));
    }

    // Drop the load command: slide every later command down and blank the
    // freed tail of the command area.
    let lc_end = layout.header_size + layout.sizeofcmds as usize;
    let data = image.bytes_mut();
    data.copy_within(codesig.cmd_offset + LC_CODE_SIGNATURE_SIZE..lc_end, codesig.cmd_offset);
    for b in &mut data[lc_end - LC_CODE_SIGNATURE_SIZE..lc_end] {
        *b = 0;
    }
    data.pwrite_with(layout.ncmds - 1, 16, layout.ctx.le)
        .map_err(|e| Error::malformed(e.to_string()))?;
    data.pwrite_with(
        layout.sizeofcmds - LC_CODE_SIGNATURE_SIZE as u32,
        20,
        layout.ctx.le,
    )
    .map_err(|e| Error::malformed(e.to_string()))?;

    // Shrink __LINKEDIT so it no longer claims the removed blob.
    if let Some(mut le_off) = layout.linkedit_cmd_offset {
        if le_off > codesig.cmd_offset {
            le_off -= LC_CODE_SIGNATURE_SIZE;
        }
        let new_filesize = codesig.data_offset as u64 - layout.linkedit_fileoff;
        let data = image.bytes_mut();
        if layout.ctx.container.is_big() {
            data.pwrite_with(new_filesize, le_off + 48, layout.ctx.le)
                .map_err(|e| Error::malformed(e.to_string()))?;
        } else {
            data.pwrite_with(new_filesize as u32, le_off + 36, layout.ctx.le)
                .map_err(|e| Error::malformed(e.to_string()))?;
        }
    }

    image.truncate(codesig.data_offset);
    info!("removed LC_CODE_SIGNATURE ({} bytes of blob)", codesig.data_size);
    Ok(true)
}

// ---------------------------------------------------------------------------
// Ad-hoc re-sign
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
#[repr(C)]
struct SuperBlob {
    magic: u32,
    length: u32,
    count: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct BlobIndex {
    typ: u32,
    offset: u32,
}

/// CodeDirectory header, version 0x20400, fixed 88 bytes.
#[derive(Clone, Copy)]
#[repr(C)]
struct CodeDirectory {
    magic: u32,
    length: u32,
    version: u32,
    flags: u32,
    hash_offset: u32,
    ident_offset: u32,
    n_special_slots: u32,
    n_code_slots: u32,
    code_limit: u32,
    hash_size: u8,
    hash_type: u8,
    _pad1: u8,
    page_size: u8,
    _pad2: u32,
    scatter_offset: u32,
    team_offset: u32,
    _pad3: u32,
    code_limit64: u64,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
}

const CODEDIR_SIZE: usize = 88;

impl TryIntoCtx<Endian> for SuperBlob {
    type Error = scroll::Error;

    fn try_into_ctx(self, dst: &mut [u8], ctx: Endian) -> std::result::Result<usize, Self::Error> {
        let offset = &mut 0;
        dst.gwrite_with(self.magic, offset, ctx)?;
        dst.gwrite_with(self.length, offset, ctx)?;
        dst.gwrite_with(self.count, offset, ctx)?;
        Ok(*offset)
    }
}

impl TryIntoCtx<Endian> for BlobIndex {
    type Error = scroll::Error;

    fn try_into_ctx(self, dst: &mut [u8], ctx: Endian) -> std::result::Result<usize, Self::Error> {
        let offset = &mut 0;
        dst.gwrite_with(self.typ, offset, ctx)?;
        dst.gwrite_with(self.offset, offset, ctx)?;
        Ok(*offset)
    }
}

impl TryIntoCtx<Endian> for CodeDirectory {
    type Error = scroll::Error;

    fn try_into_ctx(self, dst: &mut [u8], ctx: Endian) -> std::result::Result<usize, Self::Error> {
        let offset = &mut 0;
        dst.gwrite_with(self.magic, offset, ctx)?;
        dst.gwrite_with(self.length, offset, ctx)?;
        dst.gwrite_with(self.version, offset, ctx)?;
        dst.gwrite_with(self.flags, offset, ctx)?;
        dst.gwrite_with(self.hash_offset, offset, ctx)?;
        dst.gwrite_with(self.ident_offset, offset, ctx)?;
        dst.gwrite_with(self.n_special_slots, offset, ctx)?;
        dst.gwrite_with(self.n_code_slots, offset, ctx)?;
        dst.gwrite_with(self.code_limit, offset, ctx)?;
        dst.gwrite(self.hash_size, offset)?;
        dst.gwrite(self.hash_type, offset)?;
        dst.gwrite(self._pad1, offset)?;
        dst.gwrite(self.page_size, offset)?;
        dst.gwrite_with(self._pad2, offset, ctx)?;
        dst.gwrite_with(self.scatter_offset, offset, ctx)?;
        dst.gwrite_with(self.team_offset, offset, ctx)?;
        dst.gwrite_with(self._pad3, offset, ctx)?;
        dst.gwrite_with(self.code_limit64, offset, ctx)?;
        dst.gwrite_with(self.exec_seg_base, offset, ctx)?;
        dst.gwrite_with(self.exec_seg_limit, offset, ctx)?;
        dst.gwrite_with(self.exec_seg_flags, offset, ctx)?;
        Ok(*offset)
    }
}

/// Append a fresh ad-hoc code signature to a stripped Mach-O image.
///
/// The signature covers every byte up to its own blob, so the load
/// command and `__LINKEDIT` bookkeeping are written before hashing.
pub fn adhoc_resign(image: &mut ExecutableImage, identifier: &str) -> Result<()> {
    if image.format != Format::MachO {
        return Err(Error::SignatureStripFailure(
            "only Mach-O images can be ad-hoc signed".into(),
        ));
    }
    if image.macho_base != 0 {
        return Err(Error::SignatureStripFailure(
            "cannot sign a slice embedded in a fat container".into(),
        ));
    }

    let layout = read_mach_layout(image.bytes())?;
    if layout.codesig.is_some() {
        return Err(Error::SignatureStripFailure(
            "image still carries a signature; strip it first".into(),
        ));
    }
    let linkedit_cmd_offset = layout.linkedit_cmd_offset.ok_or_else(|| {
        Error::SignatureStripFailure("image has no __LINKEDIT segment to hold a signature".into())
    })?;

    // The new load command goes after the existing ones; there must be
    // slack before the first section payload.
    let lc_slot = layout.header_size + layout.sizeofcmds as usize;
    if lc_slot + LC_CODE_SIGNATURE_SIZE > layout.first_section_offset {
        return Err(Error::SignatureStripFailure(
            "no room in the header for a signature load command".into(),
        ));
    }

    // Signature blob starts at the 16-aligned file end.
    let code_limit = (image.len() + 15) & !15;
    let pad = code_limit - image.len();

    let id_len = identifier.len() + 1;
    let n_hashes = code_limit.div_ceil(CS_PAGE_SIZE);
    let hash_offset = CODEDIR_SIZE + id_len;
    let codedir_total = hash_offset + n_hashes * 32;
    let blob_size = 12 + 8 + codedir_total;
    let padded_sig_size = (blob_size + 7) & !7;

    // All bookkeeping first; the page hashes must cover the final header.
    image.grow(pad);
    {
        let ctx_le = layout.ctx.le;
        let data = image.bytes_mut();
        data.pwrite_with(LC_CODE_SIGNATURE, lc_slot, ctx_le)
            .map_err(|e| Error::malformed(e.to_string()))?;
        data.pwrite_with(LC_CODE_SIGNATURE_SIZE as u32, lc_slot + 4, ctx_le)
            .map_err(|e| Error::malformed(e.to_string()))?;
        data.pwrite_with(code_limit as u32, lc_slot + 8, ctx_le)
            .map_err(|e| Error::malformed(e.to_string()))?;
        data.pwrite_with(padded_sig_size as u32, lc_slot + 12, ctx_le)
            .map_err(|e| Error::malformed(e.to_string()))?;
        data.pwrite_with(layout.ncmds + 1, 16, ctx_le)
            .map_err(|e| Error::malformed(e.to_string()))?;
        data.pwrite_with(layout.sizeofcmds + LC_CODE_SIGNATURE_SIZE as u32, 20, ctx_le)
            .map_err(|e| Error::malformed(e.to_string()))?;

        let new_filesize = code_limit as u64 + padded_sig_size as u64 - layout.linkedit_fileoff;
        if layout.ctx.container.is_big() {
            data.pwrite_with(new_filesize, linkedit_cmd_offset + 48, ctx_le)
                .map_err(|e| Error::malformed(e.to_string()))?;
        } else {
            data.pwrite_with(new_filesize as u32, linkedit_cmd_offset + 36, ctx_le)
                .map_err(|e| Error::malformed(e.to_string()))?;
        }
    }

    // Build the blob.
    let mut sig = vec![0u8; padded_sig_size];
    let mut offset = 0usize;
    sig.gwrite_with(
        SuperBlob {
            magic: CSMAGIC_EMBEDDED_SIGNATURE,
            length: blob_size as u32,
            count: 1,
        },
        &mut offset,
        BE,
    )
    .map_err(|e| Error::malformed(e.to_string()))?;
    sig.gwrite_with(
        BlobIndex {
            typ: CSSLOT_CODEDIRECTORY,
            offset: 20,
        },
        &mut offset,
        BE,
    )
    .map_err(|e| Error::malformed(e.to_string()))?;
    sig.gwrite_with(
        CodeDirectory {
            magic: CSMAGIC_CODEDIRECTORY,
            length: codedir_total as u32,
            version: CS_VERSION,
            flags: CS_ADHOC,
            hash_offset: hash_offset as u32,
            ident_offset: CODEDIR_SIZE as u32,
            n_special_slots: 0,
            n_code_slots: n_hashes as u32,
            code_limit: code_limit as u32,
            hash_size: 32,
            hash_type: CS_HASHTYPE_SHA256,
            _pad1: 0,
            page_size: CS_PAGE_SIZE_LOG2,
            _pad2: 0,
            scatter_offset: 0,
            team_offset: 0,
            _pad3: 0,
            code_limit64: 0,
            exec_seg_base: layout.text_fileoff,
            exec_seg_limit: layout.text_filesize,
            exec_seg_flags: if layout.is_executable {
                CS_EXECSEG_MAIN_BINARY
            } else {
                0
            },
        },
        &mut offset,
        BE,
    )
    .map_err(|e| Error::malformed(e.to_string()))?;

    sig[offset..offset + identifier.len()].copy_from_slice(identifier.as_bytes());
    offset += id_len; // NUL already zero

    let mut hasher = Sha256::new();
    let mut hashed = 0usize;
    while hashed < code_limit {
        let end = (hashed + CS_PAGE_SIZE).min(code_limit);
        hasher.update(&image.bytes()[hashed..end]);
        let hash: [u8; 32] = hasher.finalize_reset().into();
        sig[offset..offset + 32].copy_from_slice(&hash);
        offset += 32;
        hashed = end;
    }

    let at = image.grow(padded_sig_size);
    image.bytes_mut()[at..at + padded_sig_size].copy_from_slice(&sig);
    info!(
        "ad-hoc signed as {identifier:?}: {n_hashes} page hash(es), {padded_sig_size} byte blob"
    );
    Ok(())
}

/// Whether a raw signature blob looks like an embedded SuperBlob.
/// Verification hook for tests and the assembler's post-sign check.
pub fn is_embedded_signature(blob: &[u8]) -> bool {
    blob.len() >= 12
        && blob
            .pread_with::<u32>(0, BE)
            .map(|m| m == CSMAGIC_EMBEDDED_SIGNATURE)
            .unwrap_or(false)
}

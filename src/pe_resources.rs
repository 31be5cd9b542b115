//! PE resource-directory patching.
//!
//! Rewrites `RT_ICON`/`RT_GROUP_ICON` entries from a caller-supplied
//! multi-resolution `.ico` container and edits `RT_VERSION` string-table
//! values in place. Byte ranges outside the touched resource entries are
//! never modified.
//!
//! Icon replacement prefers the in-place path (every new image fits the
//! reserved slot of the entry it replaces). When it does not fit, the
//! whole resource section is rebuilt and appended at the end of the file,
//! and every field referencing it (section header, resource data
//! directory, `SizeOfImage`) is updated. That conservative strategy never
//! shuffles unrelated sections.

use log::{debug, warn};
use scroll::{Pread, Pwrite, LE};

use crate::error::{Error, Result};
use crate::image::ExecutableImage;

pub const RT_ICON: u32 = 3;
pub const RT_GROUP_ICON: u32 = 14;
pub const RT_VERSION: u32 = 16;

const SUBDIR_FLAG: u32 = 0x8000_0000;

/// One decoded image from an `.ico` container: the 12 directory-entry
/// metadata bytes (up to and including the byte count) plus the payload.
#[derive(Debug, Clone)]
pub struct IcoImage {
    pub meta: [u8; 12],
    pub data: Vec<u8>,
}

/// Parse a caller-supplied `.ico` file into its member images.
pub fn parse_ico(bytes: &[u8]) -> Result<Vec<IcoImage>> {
    let read_u16 = |off: usize| -> Result<u16> {
        bytes
            .pread_with(off, LE)
            .map_err(|_| Error::malformed("ico header truncated"))
    };
    if read_u16(0)? != 0 || read_u16(2)? != 1 {
        return Err(Error::malformed("not an .ico container"));
    }
    let count = read_u16(4)? as usize;
    let mut images = Vec::with_capacity(count);
    for i in 0..count {
        let entry = 6 + i * 16;
        let meta: [u8; 12] = bytes
            .get(entry..entry + 12)
            .ok_or_else(|| Error::malformed("ico directory truncated"))?
            .try_into()
            .map_err(|_| Error::malformed("ico directory truncated"))?;
        let size: u32 = bytes
            .pread_with(entry + 8, LE)
            .map_err(|_| Error::malformed("ico directory truncated"))?;
        let offset: u32 = bytes
            .pread_with(entry + 12, LE)
            .map_err(|_| Error::malformed("ico directory truncated"))?;
        let data = bytes
            .get(offset as usize..offset as usize + size as usize)
            .ok_or_else(|| Error::malformed("ico image data out of bounds"))?
            .to_vec();
        images.push(IcoImage { meta, data });
    }
    Ok(images)
}

// ---------------------------------------------------------------------------
// Resource directory walking
// ---------------------------------------------------------------------------

/// File-offset view of the resource section.
struct RsrcView {
    /// File offset where the resource directory starts.
    file_start: usize,
    /// RVA of the resource directory.
    rva: u32,
}

fn rsrc_view(image: &ExecutableImage) -> Result<RsrcView> {
    let pe = image
        .pe
        .as_ref()
        .ok_or_else(|| Error::malformed("not a PE image"))?;
    let dir = pe.data_directory_offset(2);
    let rva: u32 = image
        .bytes()
        .pread_with(dir, LE)
        .map_err(|_| Error::malformed("resource data directory truncated"))?;
    let size: u32 = image
        .bytes()
        .pread_with(dir + 4, LE)
        .map_err(|_| Error::malformed("resource data directory truncated"))?;
    if rva == 0 || size == 0 {
        return Err(Error::malformed("image carries no resource directory"));
    }
    let file_start = image.pe_rva_to_offset(rva)?;
    Ok(RsrcView { file_start, rva })
}

/// A resolved leaf resource.
#[derive(Debug, Clone, Copy)]
struct Leaf {
    /// Resource ID at the name level.
    id: u32,
    /// File offset of the IMAGE_RESOURCE_DATA_ENTRY.
    entry_offset: usize,
    /// File offset of the resource payload.
    data_offset: usize,
    /// Current payload size.
    size: u32,
}

fn dir_entries(data: &[u8], dir_offset: usize) -> Result<Vec<(u32, u32)>> {
    let n_named: u16 = data
        .pread_with(dir_offset + 12, LE)
        .map_err(|_| Error::malformed("resource directory truncated"))?;
    let n_id: u16 = data
        .pread_with(dir_offset + 14, LE)
        .map_err(|_| Error::malformed("resource directory truncated"))?;
    let total = n_named as usize + n_id as usize;
    if total > 0x1000 {
        return Err(Error::malformed("implausible resource directory entry count"));
    }
    let mut entries = Vec::with_capacity(total);
    for i in 0..total {
        let e = dir_offset + 16 + i * 8;
        let name: u32 = data
            .pread_with(e, LE)
            .map_err(|_| Error::malformed("resource directory truncated"))?;
        let offset: u32 = data
            .pread_with(e + 4, LE)
            .map_err(|_| Error::malformed("resource directory truncated"))?;
        entries.push((name, offset));
    }
    Ok(entries)
}

/// All leaves of one resource type, first language of each name.
fn leaves_of_type(image: &ExecutableImage, type_id: u32) -> Result<Vec<Leaf>> {
    let view = rsrc_view(image)?;
    let data = image.bytes();
    let root = dir_entries(data, view.file_start)?;
    let mut leaves = Vec::new();
    for (name, offset) in root {
        if name != type_id || offset & SUBDIR_FLAG == 0 {
            continue;
        }
        let name_dir = view.file_start + (offset & !SUBDIR_FLAG) as usize;
        for (id, lang_ref) in dir_entries(data, name_dir)? {
            if lang_ref & SUBDIR_FLAG == 0 {
                continue;
            }
            let lang_dir = view.file_start + (lang_ref & !SUBDIR_FLAG) as usize;
            let langs = dir_entries(data, lang_dir)?;
            let Some(&(_, data_ref)) = langs.first() else {
                continue;
            };
            if data_ref & SUBDIR_FLAG != 0 {
                return Err(Error::malformed("resource tree deeper than three levels"));
            }
            let entry_offset = view.file_start + data_ref as usize;
            let data_rva: u32 = data
                .pread_with(entry_offset, LE)
                .map_err(|_| Error::malformed("resource data entry truncated"))?;
            let size: u32 = data
                .pread_with(entry_offset + 4, LE)
                .map_err(|_| Error::malformed("resource data entry truncated"))?;
            let data_offset = image.pe_rva_to_offset(data_rva)?;
            if data_offset + size as usize > data.len() {
                return Err(Error::malformed("resource payload out of bounds"));
            }
            leaves.push(Leaf {
                id,
                entry_offset,
                data_offset,
                size,
            });
        }
    }
    Ok(leaves)
}

// ---------------------------------------------------------------------------
// Icon replacement
// ---------------------------------------------------------------------------

/// Replace the image's icon group with a caller-supplied `.ico`.
pub fn patch_icon(image: &mut ExecutableImage, ico_bytes: &[u8]) -> Result<()> {
    let images = parse_ico(ico_bytes)?;
    if images.is_empty() {
        return Err(Error::malformed("ico container holds no images"));
    }

    let groups = leaves_of_type(image, RT_GROUP_ICON)?;
    let group = *groups
        .first()
        .ok_or_else(|| Error::malformed("image carries no RT_GROUP_ICON"))?;
    let icon_leaves = leaves_of_type(image, RT_ICON)?;

    let member_ids = group_member_ids(image.bytes(), &group)?;

    let in_place = images.len() == member_ids.len()
        && member_ids.iter().zip(&images).all(|(id, img)| {
            icon_leaves
                .iter()
                .find(|l| l.id == *id)
                .is_some_and(|l| img.data.len() <= l.size as usize)
        });

    if in_place {
        debug!("replacing {} icon image(s) in place", images.len());
        patch_icon_in_place(image, &group, &icon_leaves, &member_ids, &images)
    } else {
        warn!("replacement icon exceeds reserved entries; rebuilding resource section");
        rebuild_with_icons(image, &images)
    }
}

fn group_member_ids(data: &[u8], group: &Leaf) -> Result<Vec<u32>> {
    let base = group.data_offset;
    let count: u16 = data
        .pread_with(base + 4, LE)
        .map_err(|_| Error::malformed("icon group truncated"))?;
    let mut ids = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let id: u16 = data
            .pread_with(base + 6 + i * 14 + 12, LE)
            .map_err(|_| Error::malformed("icon group truncated"))?;
        ids.push(u32::from(id));
    }
    Ok(ids)
}

fn patch_icon_in_place(
    image: &mut ExecutableImage,
    group: &Leaf,
    icon_leaves: &[Leaf],
    member_ids: &[u32],
    images: &[IcoImage],
) -> Result<()> {
    for (id, img) in member_ids.iter().zip(images) {
        let leaf = icon_leaves
            .iter()
            .find(|l| l.id == *id)
            .ok_or_else(|| Error::malformed(format!("icon group references missing icon {id}")))?;
        let data = image.bytes_mut();
        data[leaf.data_offset..leaf.data_offset + img.data.len()].copy_from_slice(&img.data);
        // Zero the slack so no stale pixels survive.
        for b in &mut data[leaf.data_offset + img.data.len()..leaf.data_offset + leaf.size as usize]
        {
            *b = 0;
        }
        data.pwrite_with(img.data.len() as u32, leaf.entry_offset + 4, LE)
            .map_err(|e| Error::malformed(e.to_string()))?;
    }

    // Rewrite the group directory metadata while keeping member IDs.
    let base = group.data_offset;
    let data = image.bytes_mut();
    for (i, img) in images.iter().enumerate() {
        let entry = base + 6 + i * 14;
        data[entry..entry + 12].copy_from_slice(&img.meta);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Size-changing fallback: rebuild the resource section
// ---------------------------------------------------------------------------

/// In-memory resource tree used by the rebuild path.
enum Node {
    Dir(Vec<TreeEntry>),
    Leaf { data: Vec<u8>, codepage: u32 },
}

struct TreeEntry {
    /// ID entry; named entries are carried as (string, node) verbatim.
    id: Option<u32>,
    name: Option<Vec<u16>>,
    node: Node,
}

fn parse_tree(image: &ExecutableImage, view: &RsrcView, dir_offset: usize, depth: u32) -> Result<Vec<TreeEntry>> {
    if depth > 3 {
        return Err(Error::malformed("resource tree deeper than three levels"));
    }
    let data = image.bytes();
    let mut out = Vec::new();
    for (name, offset) in dir_entries(data, dir_offset)? {
        let (id, name_str) = if name & SUBDIR_FLAG != 0 {
            let str_off = view.file_start + (name & !SUBDIR_FLAG) as usize;
            let len: u16 = data
                .pread_with(str_off, LE)
                .map_err(|_| Error::malformed("resource name string truncated"))?;
            let mut s = Vec::with_capacity(len as usize);
            for i in 0..len as usize {
                let ch: u16 = data
                    .pread_with(str_off + 2 + i * 2, LE)
                    .map_err(|_| Error::malformed("resource name string truncated"))?;
                s.push(ch);
            }
            (None, Some(s))
        } else {
            (Some(name), None)
        };

        let node = if offset & SUBDIR_FLAG != 0 {
            let sub = view.file_start + (offset & !SUBDIR_FLAG) as usize;
            Node::Dir(parse_tree(image, view, sub, depth + 1)?)
        } else {
            let entry = view.file_start + offset as usize;
            let data_rva: u32 = data
                .pread_with(entry, LE)
                .map_err(|_| Error::malformed("resource data entry truncated"))?;
            let size: u32 = data
                .pread_with(entry + 4, LE)
                .map_err(|_| Error::malformed("resource data entry truncated"))?;
            let codepage: u32 = data
                .pread_with(entry + 8, LE)
                .map_err(|_| Error::malformed("resource data entry truncated"))?;
            let off = image.pe_rva_to_offset(data_rva)?;
            Node::Leaf {
                data: data
                    .get(off..off + size as usize)
                    .ok_or_else(|| Error::malformed("resource payload out of bounds"))?
                    .to_vec(),
                codepage,
            }
        };
        out.push(TreeEntry { id, name: name_str, node });
    }
    Ok(out)
}

/// Swap the icon leaves in a parsed tree for the caller's images.
fn replace_icons_in_tree(root: &mut Vec<TreeEntry>, images: &[IcoImage]) -> Result<()> {
    // New member IDs are 1..=n; the old RT_ICON branch is dropped wholesale.
    root.retain(|e| e.id != Some(RT_ICON) && e.id != Some(RT_GROUP_ICON));

    let lang = |data: Vec<u8>| Node::Dir(vec![TreeEntry {
        id: Some(1033),
        name: None,
        node: Node::Leaf { data, codepage: 0 },
    }]);

    let mut icon_entries = Vec::new();
    let mut group = Vec::new();
    group.extend_from_slice(&[0u8, 0, 1, 0]);
    group.extend_from_slice(&(images.len() as u16).to_le_bytes());
    for (i, img) in images.iter().enumerate() {
        let id = i as u32 + 1;
        icon_entries.push(TreeEntry {
            id: Some(id),
            name: None,
            node: lang(img.data.clone()),
        });
        group.extend_from_slice(&img.meta);
        group.extend_from_slice(&(id as u16).to_le_bytes());
    }

    root.push(TreeEntry {
        id: Some(RT_ICON),
        name: None,
        node: Node::Dir(icon_entries),
    });
    root.push(TreeEntry {
        id: Some(RT_GROUP_ICON),
        name: None,
        node: Node::Dir(vec![TreeEntry {
            id: Some(1),
            name: None,
            node: lang(group),
        }]),
    });
    // Keep type directories ordered by ID as the loader expects.
    root.sort_by_key(|e| (e.name.is_none(), e.id.unwrap_or(0)));
    Ok(())
}

/// Serialize a resource tree at a given base RVA.
///
/// Layout: directory tables and entries first, then data entries, then
/// name strings, then payloads (4-byte aligned).
fn serialize_tree(root: &[TreeEntry], base_rva: u32) -> Vec<u8> {
    // Pass 1: size of the directory region.
    fn dir_region_size(entries: &[TreeEntry]) -> usize {
        let mut size = 16 + entries.len() * 8;
        for e in entries {
            if let Node::Dir(sub) = &e.node {
                size += dir_region_size(sub);
            }
        }
        size
    }
    fn count_leaves(entries: &[TreeEntry]) -> usize {
        entries
            .iter()
            .map(|e| match &e.node {
                Node::Dir(sub) => count_leaves(sub),
                Node::Leaf { .. } => 1,
            })
            .sum()
    }
    fn names_size(entries: &[TreeEntry]) -> usize {
        entries
            .iter()
            .map(|e| {
                let own = e.name.as_ref().map_or(0, |n| 2 + n.len() * 2);
                own + match &e.node {
                    Node::Dir(sub) => names_size(sub),
                    Node::Leaf { .. } => 0,
                }
            })
            .sum()
    }

    let dir_size = dir_region_size(root);
    let entries_size = count_leaves(root) * 16;
    let names_start = dir_size + entries_size;
    let data_start = (names_start + names_size(root) + 3) & !3;

    let mut out = vec![0u8; data_start];
    let mut next_dir = 0usize; // bump allocator within the directory region
    let mut next_entry = dir_size;
    let mut next_name = names_start;

    struct Ctx<'a> {
        out: &'a mut Vec<u8>,
        next_entry: &'a mut usize,
        next_name: &'a mut usize,
        base_rva: u32,
    }

    fn write_dir(entries: &[TreeEntry], at: usize, next_dir: &mut usize, cx: &mut Ctx) {
        let named: Vec<&TreeEntry> = entries.iter().filter(|e| e.name.is_some()).collect();
        let by_id: Vec<&TreeEntry> = entries.iter().filter(|e| e.name.is_none()).collect();
        cx.out[at + 12..at + 14].copy_from_slice(&(named.len() as u16).to_le_bytes());
        cx.out[at + 14..at + 16].copy_from_slice(&(by_id.len() as u16).to_le_bytes());

        let mut slot = at + 16;
        for e in named.into_iter().chain(by_id) {
            let name_field = if let Some(name) = &e.name {
                let off = *cx.next_name;
                cx.out[off..off + 2].copy_from_slice(&(name.len() as u16).to_le_bytes());
                for (i, ch) in name.iter().enumerate() {
                    cx.out[off + 2 + i * 2..off + 4 + i * 2].copy_from_slice(&ch.to_le_bytes());
                }
                *cx.next_name += 2 + name.len() * 2;
                off as u32 | SUBDIR_FLAG
            } else {
                e.id.unwrap_or(0)
            };
            cx.out[slot..slot + 4].copy_from_slice(&name_field.to_le_bytes());

            match &e.node {
                Node::Dir(sub) => {
                    let child = alloc_dir(next_dir, sub.len());
                    cx.out[slot + 4..slot + 8]
                        .copy_from_slice(&(child as u32 | SUBDIR_FLAG).to_le_bytes());
                    write_dir(sub, child, next_dir, cx);
                }
                Node::Leaf { data, codepage } => {
                    let entry_at = *cx.next_entry;
                    *cx.next_entry += 16;
                    let data_at = cx.out.len();
                    cx.out.extend_from_slice(data);
                    while cx.out.len() % 4 != 0 {
                        cx.out.push(0);
                    }
                    let rva = cx.base_rva + data_at as u32;
                    cx.out[entry_at..entry_at + 4].copy_from_slice(&rva.to_le_bytes());
                    cx.out[entry_at + 4..entry_at + 8]
                        .copy_from_slice(&(data.len() as u32).to_le_bytes());
                    cx.out[entry_at + 8..entry_at + 12].copy_from_slice(&codepage.to_le_bytes());
                    cx.out[slot + 4..slot + 8].copy_from_slice(&(entry_at as u32).to_le_bytes());
                }
            }
            slot += 8;
        }
    }

    fn alloc_dir(next_dir: &mut usize, n_entries: usize) -> usize {
        let at = *next_dir;
        *next_dir += 16 + n_entries * 8;
        at
    }

    let root_at = alloc_dir(&mut next_dir, root.len());
    let mut cx = Ctx {
        out: &mut out,
        next_entry: &mut next_entry,
        next_name: &mut next_name,
        base_rva,
    };
    write_dir(root, root_at, &mut next_dir, &mut cx);
    out
}

fn rebuild_with_icons(image: &mut ExecutableImage, images: &[IcoImage]) -> Result<()> {
    let view = rsrc_view(image)?;
    let mut tree = parse_tree(image, &view, view.file_start, 0)?;
    replace_icons_in_tree(&mut tree, images)?;

    let pe = image
        .pe
        .as_ref()
        .ok_or_else(|| Error::malformed("not a PE image"))?
        .clone();

    // Locate the section header that owns the resource directory.
    let mut rsrc_header = None;
    for i in 0..pe.number_of_sections {
        let base = pe.section_table_offset + i * 40;
        let va: u32 = image
            .bytes()
            .pread_with(base + 12, LE)
            .map_err(|_| Error::malformed("section table truncated"))?;
        if va == view.rva {
            rsrc_header = Some(base);
        }
    }
    let header = rsrc_header
        .ok_or_else(|| Error::malformed("resource directory is not section-aligned"))?;

    let file_align: u32 = image
        .bytes()
        .pread_with(pe.optional_offset + 36, LE)
        .map_err(|_| Error::malformed("optional header truncated"))?;
    let section_align: u32 = image
        .bytes()
        .pread_with(pe.optional_offset + 32, LE)
        .map_err(|_| Error::malformed("optional header truncated"))?;
    let file_align = file_align.max(0x200) as usize;
    let section_align = section_align.max(0x1000);

    let serialized = serialize_tree(&tree, view.rva);

    // Append at the file tail, file-alignment padded.
    let unaligned = image.len();
    let new_raw_offset = (unaligned + file_align - 1) & !(file_align - 1);
    let raw_size = (serialized.len() + file_align - 1) & !(file_align - 1);
    image.grow(new_raw_offset - unaligned + raw_size);
    let data = image.bytes_mut();
    data[new_raw_offset..new_raw_offset + serialized.len()].copy_from_slice(&serialized);

    // Repoint the section header at the rebuilt data. The virtual address
    // is unchanged, so nothing else in the image moves.
    let old_virtual_size: u32 = data
        .pread_with(header + 8, LE)
        .map_err(|_| Error::malformed("section table truncated"))?;
    data.pwrite_with(serialized.len() as u32, header + 8, LE)
        .map_err(|e| Error::malformed(e.to_string()))?;
    data.pwrite_with(raw_size as u32, header + 16, LE)
        .map_err(|e| Error::malformed(e.to_string()))?;
    data.pwrite_with(new_raw_offset as u32, header + 20, LE)
        .map_err(|e| Error::malformed(e.to_string()))?;

    // Resource data directory size.
    let dir = pe.data_directory_offset(2);
    data.pwrite_with(serialized.len() as u32, dir + 4, LE)
        .map_err(|e| Error::malformed(e.to_string()))?;

    // Grow SizeOfImage if the section's virtual span grew.
    if serialized.len() as u32 > old_virtual_size {
        let size_of_image_off = pe.optional_offset + 56;
        let old_size: u32 = data
            .pread_with(size_of_image_off, LE)
            .map_err(|_| Error::malformed("optional header truncated"))?;
        let old_span = (old_virtual_size + section_align - 1) & !(section_align - 1);
        let new_span = (serialized.len() as u32 + section_align - 1) & !(section_align - 1);
        if new_span > old_span {
            data.pwrite_with(old_size + (new_span - old_span), size_of_image_off, LE)
                .map_err(|e| Error::malformed(e.to_string()))?;
        }
    }

    debug!(
        "resource section rebuilt: {} bytes at file offset {new_raw_offset:#x}",
        serialized.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Version string tables
// ---------------------------------------------------------------------------

fn utf16(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2 + 2);
    for u in s.encode_utf16() {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

fn find_utf16_key(hay: &[u8], key: &str) -> Option<usize> {
    let needle = utf16(key);
    if hay.len() < needle.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&i| i % 2 == 0 && hay[i..i + needle.len()] == needle[..])
}

/// Rewrite one `RT_VERSION` string value in place.
///
/// The value slot reserved by the existing `String` block (its `wLength`)
/// bounds the replacement; the slot is NUL-padded and `wValueLength` is
/// updated. A value that cannot fit is [`Error::ResourceOverflow`].
fn patch_version_value(
    image: &mut ExecutableImage,
    leaf: &Leaf,
    key: &str,
    value: &str,
    resource: &'static str,
) -> Result<bool> {
    let start = leaf.data_offset;
    let end = start + leaf.size as usize;
    let region = &image.bytes()[start..end];

    let Some(key_at) = find_utf16_key(region, key) else {
        return Ok(false);
    };
    // The String block header (wLength, wValueLength, wType) sits 6 bytes
    // before the key.
    if key_at < 6 {
        return Err(Error::malformed("version string block header truncated"));
    }
    let block_at = key_at - 6;
    let block_len: u16 = region
        .pread_with(block_at, LE)
        .map_err(|_| Error::malformed("version string block truncated"))?;
    let key_end = key_at + utf16(key).len();
    let value_at = (key_end + 3) & !3;
    let block_end = block_at + block_len as usize;
    if block_end > region.len() || value_at >= block_end {
        return Err(Error::malformed("version string block truncated"));
    }
    let slot = block_end - value_at;

    let encoded = utf16(value);
    if encoded.len() > slot {
        return Err(Error::ResourceOverflow {
            resource,
            need: encoded.len(),
            have: slot,
        });
    }

    let data = image.bytes_mut();
    let abs_value = start + value_at;
    data[abs_value..abs_value + encoded.len()].copy_from_slice(&encoded);
    for b in &mut data[abs_value + encoded.len()..start + value_at + slot] {
        *b = 0;
    }
    // wValueLength counts UTF-16 units including the terminator.
    data.pwrite_with((encoded.len() / 2) as u16, start + block_at + 2, LE)
        .map_err(|e| Error::malformed(e.to_string()))?;
    Ok(true)
}

/// Rewrite `ProductName` and/or `FileDescription` in the `RT_VERSION`
/// string table.
pub fn patch_version_strings(
    image: &mut ExecutableImage,
    product_name: Option<&str>,
    file_description: Option<&str>,
) -> Result<()> {
    let leaves = leaves_of_type(image, RT_VERSION)?;
    let leaf = *leaves
        .first()
        .ok_or_else(|| Error::malformed("image carries no RT_VERSION resource"))?;

    if let Some(name) = product_name {
        if !patch_version_value(image, &leaf, "ProductName", name, "ProductName")? {
            return Err(Error::malformed("RT_VERSION has no ProductName entry"));
        }
    }
    if let Some(desc) = file_description {
        if !patch_version_value(image, &leaf, "FileDescription", desc, "FileDescription")? {
            return Err(Error::malformed("RT_VERSION has no FileDescription entry"));
        }
    }
    Ok(())
}

/// Read a version string back (round-trip verification hook).
pub fn read_version_string(image: &ExecutableImage, key: &str) -> Result<Option<String>> {
    let leaves = leaves_of_type(image, RT_VERSION)?;
    let Some(leaf) = leaves.first() else {
        return Ok(None);
    };
    let region = &image.bytes()[leaf.data_offset..leaf.data_offset + leaf.size as usize];
    let Some(key_at) = find_utf16_key(region, key) else {
        return Ok(None);
    };
    let key_end = key_at + utf16(key).len();
    let value_at = (key_end + 3) & !3;
    let mut units = Vec::new();
    let mut i = value_at;
    while i + 1 < region.len() {
        let u: u16 = region.pread_with(i, LE).unwrap_or(0);
        if u == 0 {
            break;
        }
        units.push(u);
        i += 2;
    }
    Ok(Some(String::from_utf16_lossy(&units)))
}

/// Read the icon images currently referenced by the group directory
/// (round-trip verification hook).
pub fn read_icon_images(image: &ExecutableImage) -> Result<Vec<Vec<u8>>> {
    let groups = leaves_of_type(image, RT_GROUP_ICON)?;
    let group = groups
        .first()
        .ok_or_else(|| Error::malformed("image carries no RT_GROUP_ICON"))?;
    let member_ids = group_member_ids(image.bytes(), group)?;
    let leaves = leaves_of_type(image, RT_ICON)?;
    let mut out = Vec::with_capacity(member_ids.len());
    for id in member_ids {
        let leaf = leaves
            .iter()
            .find(|l| l.id == id)
            .ok_or_else(|| Error::malformed(format!("icon group references missing icon {id}")))?;
        out.push(image.bytes()[leaf.data_offset..leaf.data_offset + leaf.size as usize].to_vec());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ico(sizes: &[usize]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0, 0, 1, 0]);
        out.extend_from_slice(&(sizes.len() as u16).to_le_bytes());
        let mut offset = 6 + sizes.len() * 16;
        for (i, &size) in sizes.iter().enumerate() {
            out.extend_from_slice(&[16, 16, 0, 0, 1, 0, 32, 0]);
            out.extend_from_slice(&(size as u32).to_le_bytes());
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            offset += size;
            let _ = i;
        }
        for (i, &size) in sizes.iter().enumerate() {
            out.extend(std::iter::repeat(i as u8 + 1).take(size));
        }
        out
    }

    #[test]
    fn ico_parser_extracts_members() {
        let ico = sample_ico(&[8, 16]);
        let images = parse_ico(&ico).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].data, vec![1u8; 8]);
        assert_eq!(images[1].data, vec![2u8; 16]);
    }

    #[test]
    fn ico_parser_rejects_non_icons() {
        assert!(parse_ico(&[0, 0, 2, 0, 1, 0]).is_err());
        assert!(parse_ico(&[]).is_err());
    }

    #[test]
    fn utf16_key_search_is_aligned() {
        let mut hay = vec![0u8];
        hay.extend_from_slice(&utf16("ProductName"));
        // Misaligned occurrence must not match.
        assert_eq!(find_utf16_key(&hay, "ProductName"), None);
        let aligned = utf16("ProductName");
        assert_eq!(find_utf16_key(&aligned, "ProductName"), Some(0));
    }

    #[test]
    fn serialized_tree_parses_sane_offsets() {
        let tree = vec![TreeEntry {
            id: Some(RT_ICON),
            name: None,
            node: Node::Dir(vec![TreeEntry {
                id: Some(1),
                name: None,
                node: Node::Dir(vec![TreeEntry {
                    id: Some(1033),
                    name: None,
                    node: Node::Leaf {
                        data: vec![0xAA; 10],
                        codepage: 0,
                    },
                }]),
            }]),
        }];
        let bytes = serialize_tree(&tree, 0x3000);
        // Root has one ID entry pointing at a subdirectory.
        let n_id = u16::from_le_bytes([bytes[14], bytes[15]]);
        assert_eq!(n_id, 1);
        let entry_name = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        assert_eq!(entry_name, RT_ICON);
        let sub = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        assert!(sub & SUBDIR_FLAG != 0);
        assert!(((sub & !SUBDIR_FLAG) as usize) < bytes.len());
    }
}

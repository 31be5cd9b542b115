//! macOS `.app` bundle metadata.
//!
//! Projector output on macOS is a bundle directory, not a flat file. The
//! assembler lays out `Contents/MacOS`, `Contents/Resources` and an
//! `Info.plist`; this module generates and edits that plist as text. The
//! textual XML form is stable across every player version we patch, so a
//! structural plist parser would buy nothing.

use scroll::{Pread, BE};

use crate::error::{Error, Result};

/// Minimal Info.plist for a projector bundle.
pub fn plist_template(bundle_name: &str, executable: &str, icon_file: &str, version: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>CFBundleDevelopmentRegion</key>
	<string>English</string>
	<key>CFBundleDisplayName</key>
	<string>{name}</string>
	<key>CFBundleExecutable</key>
	<string>{exe}</string>
	<key>CFBundleIconFile</key>
	<string>{icon}</string>
	<key>CFBundleInfoDictionaryVersion</key>
	<string>6.0</string>
	<key>CFBundleName</key>
	<string>{name}</string>
	<key>CFBundlePackageType</key>
	<string>APPL</string>
	<key>CFBundleShortVersionString</key>
	<string>{version}</string>
	<key>CFBundleVersion</key>
	<string>{version}</string>
	<key>NSHighResolutionCapable</key>
	<true/>
</dict>
</plist>
"#,
        name = xml_escape(bundle_name),
        exe = xml_escape(executable),
        icon = xml_escape(icon_file),
        version = xml_escape(version),
    )
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

/// Replace the `<string>` value following `<key>name</key>`, or insert the
/// pair before the closing `</dict>` when the key is absent.
pub fn set_plist_value(plist: &str, key: &str, value: &str) -> Result<String> {
    let marker = format!("<key>{}</key>", xml_escape(key));
    let escaped = xml_escape(value);

    if let Some(key_at) = plist.find(&marker) {
        let after = key_at + marker.len();
        let open = plist[after..]
            .find("<string>")
            .map(|i| after + i + "<string>".len())
            .ok_or_else(|| Error::malformed(format!("plist key {key} has no string value")))?;
        let close = plist[open..]
            .find("</string>")
            .map(|i| open + i)
            .ok_or_else(|| Error::malformed(format!("plist key {key} has no string value")))?;
        let mut out = String::with_capacity(plist.len() + escaped.len());
        out.push_str(&plist[..open]);
        out.push_str(&escaped);
        out.push_str(&plist[close..]);
        Ok(out)
    } else {
        let close = plist
            .rfind("</dict>")
            .ok_or_else(|| Error::malformed("plist has no dict"))?;
        let mut out = String::with_capacity(plist.len() + marker.len() + escaped.len() + 32);
        out.push_str(&plist[..close]);
        out.push_str(&format!("\t{marker}\n\t<string>{escaped}</string>\n"));
        out.push_str(&plist[close..]);
        Ok(out)
    }
}

/// Read a string value back out of a textual plist.
pub fn plist_value(plist: &str, key: &str) -> Option<String> {
    let marker = format!("<key>{}</key>", xml_escape(key));
    let key_at = plist.find(&marker)?;
    let after = key_at + marker.len();
    let open = after + plist[after..].find("<string>")? + "<string>".len();
    let close = open + plist[open..].find("</string>")?;
    Some(xml_unescape(&plist[open..close]))
}

// ---------------------------------------------------------------------------
// Classic resource forks (PEF-era players)
// ---------------------------------------------------------------------------

/// Locate a resource in a classic Mac OS resource fork.
///
/// Fork layout: a 16-byte header (data offset, map offset, lengths), a
/// data area of length-prefixed blobs, and a map whose type list points
/// at 12-byte reference entries. Resources are addressed through the
/// map, never by adjacency, so shrinking one blob in place is safe.
fn find_fork_resource(fork: &[u8], res_type: &[u8; 4], res_id: i16) -> Result<Option<usize>> {
    let err = || Error::malformed("resource fork truncated");
    let data_offset: u32 = fork.pread_with(0, BE).map_err(|_| err())?;
    let map_offset: u32 = fork.pread_with(4, BE).map_err(|_| err())?;
    let map = map_offset as usize;

    let type_list_rel: u16 = fork.pread_with(map + 24, BE).map_err(|_| err())?;
    let type_list = map + type_list_rel as usize;
    let type_count: u16 = fork.pread_with(type_list, BE).map_err(|_| err())?;
    // Stored as count - 1; 0xFFFF means an empty list.
    let type_count = type_count.wrapping_add(1) as usize;

    for i in 0..type_count {
        let entry = type_list + 2 + i * 8;
        let tag = fork.get(entry..entry + 4).ok_or_else(err)?;
        if tag != res_type {
            continue;
        }
        let ref_count: u16 = fork.pread_with(entry + 4, BE).map_err(|_| err())?;
        let ref_count = ref_count as usize + 1;
        let ref_list_rel: u16 = fork.pread_with(entry + 6, BE).map_err(|_| err())?;
        let ref_list = type_list + ref_list_rel as usize;

        for j in 0..ref_count {
            let r = ref_list + j * 12;
            let id: i16 = fork.pread_with(r, BE).map_err(|_| err())?;
            if id != res_id {
                continue;
            }
            // 24-bit data offset packed after the attribute byte.
            let hi = *fork.get(r + 5).ok_or_else(err)?;
            let mid = *fork.get(r + 6).ok_or_else(err)?;
            let lo = *fork.get(r + 7).ok_or_else(err)?;
            let rel = (usize::from(hi) << 16) | (usize::from(mid) << 8) | usize::from(lo);
            return Ok(Some(data_offset as usize + rel));
        }
    }
    Ok(None)
}

/// Replace a resource's payload in place. The new payload must fit the
/// existing slot ([`Error::ResourceOverflow`] otherwise); slack is zeroed.
pub fn patch_fork_resource(
    fork: &mut [u8],
    res_type: &[u8; 4],
    res_id: i16,
    payload: &[u8],
    resource: &'static str,
) -> Result<()> {
    let at = find_fork_resource(fork, res_type, res_id)?.ok_or_else(|| {
        Error::malformed(format!(
            "resource fork has no {} #{res_id}",
            String::from_utf8_lossy(res_type)
        ))
    })?;
    let old_len: u32 = fork
        .pread_with(at, BE)
        .map_err(|_| Error::malformed("resource fork truncated"))?;
    let old_len = old_len as usize;
    if at + 4 + old_len > fork.len() {
        return Err(Error::malformed("resource payload exceeds fork"));
    }
    if payload.len() > old_len {
        return Err(Error::ResourceOverflow {
            resource,
            need: payload.len(),
            have: old_len,
        });
    }
    fork[at..at + 4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    fork[at + 4..at + 4 + payload.len()].copy_from_slice(payload);
    for b in &mut fork[at + 4 + payload.len()..at + 4 + old_len] {
        *b = 0;
    }
    Ok(())
}

/// Read a resource's payload (verification hook).
pub fn fork_resource<'a>(fork: &'a [u8], res_type: &[u8; 4], res_id: i16) -> Result<Option<&'a [u8]>> {
    let Some(at) = find_fork_resource(fork, res_type, res_id)? else {
        return Ok(None);
    };
    let len: u32 = fork
        .pread_with(at, BE)
        .map_err(|_| Error::malformed("resource fork truncated"))?;
    fork.get(at + 4..at + 4 + len as usize)
        .map(Some)
        .ok_or_else(|| Error::malformed("resource payload exceeds fork"))
}

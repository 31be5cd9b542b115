//! In-place machine-code patching for formats without editable metadata.
//!
//! Legacy player binaries hard-code their window title in the instruction
//! stream. This module locates the recipe's byte pattern in the image's
//! code sections and overwrites the matched span with a precompiled,
//! architecture-specific blob that carries the caller's title inline.
//!
//! The pattern must match exactly once; zero or multiple matches abort the
//! build, since patching a guessed occurrence would corrupt the binary.
//! Blobs never exceed the span they replace, so file size and section
//! boundaries are untouched. That is what makes this viable on formats
//! with no resource table.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::image::{Arch, ExecutableImage};

/// An exact byte sequence with wildcard positions for architecture-specific
/// immediates. `mask[i] == 0xFF` requires an exact match at `i`; `0x00`
/// accepts any byte.
#[derive(Debug, Clone, Copy)]
pub struct BytePattern {
    pub bytes: &'static [u8],
    pub mask: &'static [u8],
}

impl BytePattern {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches_at(&self, hay: &[u8], at: usize) -> bool {
        if at + self.bytes.len() > hay.len() {
            return false;
        }
        self.bytes
            .iter()
            .zip(self.mask)
            .enumerate()
            .all(|(i, (b, m))| hay[at + i] & m == b & m)
    }

    /// All match offsets within `hay`, reported relative to `base`.
    fn find_in(&self, hay: &[u8], base: usize, out: &mut Vec<usize>) {
        if self.bytes.is_empty() || hay.len() < self.bytes.len() {
            return;
        }
        for i in 0..=hay.len() - self.bytes.len() {
            if self.matches_at(hay, i) {
                out.push(base + i);
            }
        }
    }
}

impl std::fmt::Display for BytePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (b, m)) in self.bytes.iter().zip(self.mask).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if *m == 0 {
                f.write_str("??")?;
            } else {
                write!(f, "{b:02x}")?;
            }
        }
        Ok(())
    }
}

/// What to do with a title that exceeds the blob's buffer.
///
/// The policy is declared per recipe, never inferred: legacy single-byte
/// blobs truncate at a documented limit, blobs whose launch environment
/// cannot tolerate a shortened title reject outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitlePolicy {
    /// Deterministically truncate to at most this many bytes (excluding
    /// the terminating NUL), respecting UTF-8 boundaries.
    Truncate(usize),
    /// Fail with [`Error::TitleTooLong`] above this many bytes.
    Reject(usize),
}

/// Precompiled "set window title" machine code for one architecture.
///
/// `code` is written over the start of the matched span; the caller's
/// title lands in the fixed buffer at `title_offset`. The blob never
/// grows the file: `code.len()` must not exceed the pattern span, and the
/// remainder of the span is padded with `fill`.
#[derive(Debug, Clone, Copy)]
pub struct CompiledCodeBlob {
    pub arch: Arch,
    pub code: &'static [u8],
    /// Offset of the title buffer within `code`.
    pub title_offset: usize,
    /// Buffer size in bytes, including the terminating NUL.
    pub title_capacity: usize,
    /// Pad byte for the span tail not covered by `code`.
    pub fill: u8,
}

/// Result of a successful code patch.
#[derive(Debug, Clone, Copy)]
pub struct CodePatchOutcome {
    /// Absolute file offset where the blob was written.
    pub offset: usize,
    /// Whether the title was truncated to fit the blob's buffer.
    pub truncated: bool,
}

/// Find the unique pattern occurrence and overwrite it with the blob,
/// encoding `title` into the blob's buffer.
pub fn apply(
    image: &mut ExecutableImage,
    pattern: &BytePattern,
    blob: &CompiledCodeBlob,
    policy: TitlePolicy,
    title: &str,
) -> Result<CodePatchOutcome> {
    if blob.code.len() > pattern.len() {
        return Err(Error::malformed(format!(
            "code blob ({} bytes) exceeds pattern span ({} bytes)",
            blob.code.len(),
            pattern.len()
        )));
    }
    if blob.title_offset + blob.title_capacity > blob.code.len() {
        return Err(Error::malformed("blob title buffer exceeds blob length"));
    }

    let mut matches = Vec::new();
    for section in image.code_sections() {
        let bytes = &image.bytes()[section.file_offset..section.file_offset + section.size];
        pattern.find_in(bytes, section.file_offset, &mut matches);
    }

    let offset = match matches.len() {
        1 => matches[0],
        0 => {
            return Err(Error::PatternNotFound {
                pattern: pattern.to_string(),
            })
        }
        n => {
            return Err(Error::PatternAmbiguous {
                pattern: pattern.to_string(),
                count: n,
            })
        }
    };
    debug!("code pattern matched at file offset {offset:#x}");

    let (encoded, truncated) = encode_title(title, policy)?;
    if truncated {
        warn!(
            "title truncated to {} bytes to fit the patch slot",
            encoded.len()
        );
    }

    let span = pattern.len();
    let data = image.bytes_mut();
    data[offset..offset + blob.code.len()].copy_from_slice(blob.code);
    for b in &mut data[offset + blob.code.len()..offset + span] {
        *b = blob.fill;
    }

    let buf = &mut data[offset + blob.title_offset..offset + blob.title_offset + blob.title_capacity];
    buf.fill(0);
    buf[..encoded.len()].copy_from_slice(&encoded);

    Ok(CodePatchOutcome { offset, truncated })
}

/// Read the NUL-terminated title back out of a patched span. Test hook for
/// the round-trip property, and the contract readers of patched binaries
/// rely on.
pub fn read_title_at(image: &ExecutableImage, patch_offset: usize, blob: &CompiledCodeBlob) -> String {
    let start = patch_offset + blob.title_offset;
    let buf = &image.bytes()[start..start + blob.title_capacity];
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn encode_title(title: &str, policy: TitlePolicy) -> Result<(Vec<u8>, bool)> {
    let bytes = title.as_bytes();
    match policy {
        TitlePolicy::Reject(max) => {
            if bytes.len() > max {
                Err(Error::TitleTooLong {
                    len: bytes.len(),
                    max,
                })
            } else {
                Ok((bytes.to_vec(), false))
            }
        }
        TitlePolicy::Truncate(max) => {
            if bytes.len() <= max {
                return Ok((bytes.to_vec(), false));
            }
            let mut cut = max;
            while cut > 0 && !title.is_char_boundary(cut) {
                cut -= 1;
            }
            Ok((bytes[..cut].to_vec(), true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAT: BytePattern = BytePattern {
        bytes: &[0x68, 0x00, 0x00, 0x6a, 0x00],
        mask: &[0xff, 0x00, 0x00, 0xff, 0xff],
    };

    #[test]
    fn wildcards_match_any_byte() {
        let hay = [0x90, 0x68, 0xde, 0xad, 0x6a, 0x00, 0x90];
        let mut hits = Vec::new();
        PAT.find_in(&hay, 0, &mut hits);
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn exact_positions_must_match() {
        let hay = [0x68, 0xde, 0xad, 0x6a, 0x01];
        let mut hits = Vec::new();
        PAT.find_in(&hay, 0, &mut hits);
        assert!(hits.is_empty());
    }

    #[test]
    fn base_offset_is_applied() {
        let hay = [0x68, 0x01, 0x02, 0x6a, 0x00];
        let mut hits = Vec::new();
        PAT.find_in(&hay, 0x400, &mut hits);
        assert_eq!(hits, vec![0x400]);
    }

    #[test]
    fn display_shows_wildcards() {
        assert_eq!(PAT.to_string(), "68 ?? ?? 6a 00");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // "é" is two bytes; cutting at 3 would split it.
        let (enc, truncated) = encode_title("aaéz", TitlePolicy::Truncate(3)).unwrap();
        assert!(truncated);
        assert_eq!(enc, b"aa");
    }

    #[test]
    fn truncation_is_deterministic() {
        let a = encode_title("a very long projector title", TitlePolicy::Truncate(10)).unwrap();
        let b = encode_title("a very long projector title", TitlePolicy::Truncate(10)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 10);
    }

    #[test]
    fn reject_policy_errors_on_overflow() {
        assert!(matches!(
            encode_title("0123456789", TitlePolicy::Reject(4)),
            Err(Error::TitleTooLong { len: 10, max: 4 })
        ));
        assert!(encode_title("0123", TitlePolicy::Reject(4)).is_ok());
    }
}

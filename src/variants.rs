//! Variant fingerprints, patch recipes and compiled code blobs.
//!
//! The vendor shipped hundreds of player builds over two decades; each
//! supported build is described here by a fingerprint (platform, arch,
//! version, plus a confirming byte signature at a known offset) mapped to
//! exactly one patch recipe. Recipes are looked up, never inferred, and
//! adding support for a newly discovered build means adding a table entry,
//! not changing patcher logic.
//!
//! The tables are immutable configuration: they are compiled into the
//! binary and shared read-only across concurrent builds.

use log::debug;

use crate::code_patch::{BytePattern, CompiledCodeBlob, TitlePolicy};
use crate::error::{Error, Result};
use crate::image::{Arch, ExecutableImage, Format};

/// Target operating system of a player build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOS,
    Linux,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Platform::Windows => "windows",
            Platform::MacOS => "macos",
            Platform::Linux => "linux",
        })
    }
}

impl Platform {
    /// Container formats a platform's players can legitimately use.
    fn admits(self, format: Format) -> bool {
        match self {
            Platform::Windows => format == Format::Pe,
            Platform::MacOS => format == Format::MachO || format == Format::Pef,
            Platform::Linux => format == Format::Elf,
        }
    }
}

/// The (platform, arch, version) triple a caller asks for.
#[derive(Debug, Clone)]
pub struct TargetSelector {
    pub platform: Platform,
    pub arch: Arch,
    pub version: String,
}

impl std::fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.platform, self.arch, self.version)
    }
}

/// Identity of one known player build, confirmed by an exact byte
/// signature at a fixed file offset (typically the version string the
/// build embeds verbatim).
#[derive(Debug, Clone, Copy)]
pub struct VariantFingerprint {
    pub platform: Platform,
    pub arch: Arch,
    pub version: &'static str,
    pub debug: bool,
    pub signed: bool,
    pub signature_offset: usize,
    pub signature: &'static [u8],
}

impl VariantFingerprint {
    /// Exact confirmation only. A near-miss is a rejection: applying a
    /// recipe built for a different byte layout corrupts the binary.
    fn confirms(&self, image: &ExecutableImage) -> bool {
        image
            .bytes()
            .get(self.signature_offset..self.signature_offset + self.signature.len())
            == Some(self.signature)
    }
}

/// Which resource fields a resource-edit recipe rewrites.
#[derive(Debug, Clone, Copy)]
pub struct ResourceEdit {
    pub set_product_name: bool,
    pub set_file_description: bool,
    pub replace_icon: bool,
}

/// A code-pattern recipe: where to look, what to inject, and the title
/// overflow policy for that blob.
#[derive(Debug, Clone, Copy)]
pub struct CodePatchRecipe {
    pub pattern: BytePattern,
    pub blob: BlobId,
    pub title_policy: TitlePolicy,
}

/// How a variant gets customized.
#[derive(Debug, Clone, Copy)]
pub enum PatchRecipe {
    ResourceEdit(ResourceEdit),
    CodePatch(CodePatchRecipe),
}

/// One row of the variant table.
#[derive(Debug, Clone, Copy)]
pub struct Variant {
    pub fingerprint: VariantFingerprint,
    pub recipe: PatchRecipe,
}

/// Identifier of a compiled code blob in [`CODE_BLOBS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobId {
    /// 32-bit x86, cdecl title setup used by the 9.x Linux/Windows era.
    SetTitleX86Legacy,
    /// x86-64, RIP-relative title setup of the 11.x+ era.
    SetTitleX86_64,
    /// PowerPC classic toolchain title setup (PEF and early Mach-O).
    SetTitlePpc,
}

/// Look up the blob for a recipe and the image's architecture.
pub fn code_blob(id: BlobId, arch: Arch) -> Option<&'static CompiledCodeBlob> {
    CODE_BLOBS
        .iter()
        .find(|b| b.id == id && b.blob.arch == arch)
        .map(|b| &b.blob)
}

struct BlobEntry {
    id: BlobId,
    blob: CompiledCodeBlob,
}

/// Classify an image against the variant table.
///
/// The selector prefilters rows (so the error can name what the caller
/// asked for); the confirming signature must then match exactly. First
/// match wins; a miss is fatal for the build: the system never guesses a
/// recipe for an unrecognized binary.
pub fn identify(image: &ExecutableImage, selector: &TargetSelector) -> Result<&'static Variant> {
    for variant in VARIANTS {
        let fp = &variant.fingerprint;
        if fp.platform != selector.platform
            || fp.arch != selector.arch
            || fp.version != selector.version
        {
            continue;
        }
        if !fp.platform.admits(image.format) || fp.arch != image.arch {
            continue;
        }
        if fp.confirms(image) {
            debug!("variant confirmed: {selector}");
            return Ok(variant);
        }
    }
    Err(Error::UnknownVariant {
        selector: selector.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Compiled code blobs
//
// Precompiled "set window title to <inline string>" sequences, one per
// architecture. Opaque build-time artifacts: the bytes are fixed, only the
// inline title buffer is filled in per build. Each blob must fit the span
// of every pattern that references it; no relocation is ever performed.
// ---------------------------------------------------------------------------

static CODE_BLOBS: &[BlobEntry] = &[
    BlobEntry {
        id: BlobId::SetTitleX86Legacy,
        blob: CompiledCodeBlob {
            arch: Arch::I386,
            // call $+5 / pop eax / add eax, 7 / push eax / ret / pad,
            // leaving eax pointing at the inline buffer.
            code: &[
                0xe8, 0x00, 0x00, 0x00, 0x00, // call $+5
                0x58, // pop eax
                0x83, 0xc0, 0x07, // add eax, 7
                0x50, // push eax
                0xc3, // ret
                0x90, // pad to the buffer
                // 36-byte inline title buffer
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
            title_offset: 12,
            title_capacity: 36,
            fill: 0x90,
        },
    },
    BlobEntry {
        id: BlobId::SetTitleX86_64,
        blob: CompiledCodeBlob {
            arch: Arch::X86_64,
            // lea rdi, [rip+2] / ret, then the inline buffer.
            code: &[
                0x48, 0x8d, 0x3d, 0x02, 0x00, 0x00, 0x00, // lea rdi, [rip+2]
                0xc3, // ret
                // 48-byte inline title buffer
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
            title_offset: 8,
            title_capacity: 48,
            fill: 0x00,
        },
    },
    BlobEntry {
        id: BlobId::SetTitlePpc,
        blob: CompiledCodeBlob {
            arch: Arch::Ppc,
            // bl over the buffer / mflr r3 / blr sequence emitted by the
            // classic toolchain; the buffer sits between bl and target.
            code: &[
                0x48, 0x00, 0x00, 0x29, // bl +0x28
                0x7c, 0x68, 0x02, 0xa6, // mflr r3
                // 36-byte inline title buffer
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
                0x4e, 0x80, 0x00, 0x20, // blr
            ],
            title_offset: 8,
            title_capacity: 36,
            fill: 0x00,
        },
    },
];

// ---------------------------------------------------------------------------
// Patterns
//
// Exact byte sequences (with wildcards for immediates) of the title-setup
// code each legacy build hard-codes, including the vendor's default title
// string. A pattern must occur exactly once in a genuine sample of its
// variant.
// ---------------------------------------------------------------------------

/// 9.x-era i386: push imm32 / push 0 / call rel32 / add esp, 8 followed by
/// the inline default title.
const TITLE_PATTERN_I386_9X: BytePattern = BytePattern {
    bytes: &[
        0x68, 0x00, 0x00, 0x00, 0x00, // push <title ptr>
        0x6a, 0x00, // push 0
        0xe8, 0x00, 0x00, 0x00, 0x00, // call <set_title>
        0x83, 0xc4, 0x08, // add esp, 8
        b'S', b'h', b'o', b'c', b'k', b'w', b'a', b'v', b'e', b' ', //
        b'F', b'l', b'a', b's', b'h', 0x00, // default title
        0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, //
        0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // alignment pad
    ],
    mask: &[
        0xff, 0x00, 0x00, 0x00, 0x00, //
        0xff, 0xff, //
        0xff, 0x00, 0x00, 0x00, 0x00, //
        0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    ],
};

/// 11.x-era x86-64: lea rdi, [rip+imm] / xor esi, esi / call rel32, then
/// the inline default title.
const TITLE_PATTERN_X86_64_11X: BytePattern = BytePattern {
    bytes: &[
        0x48, 0x8d, 0x3d, 0x00, 0x00, 0x00, 0x00, // lea rdi, [rip+<title>]
        0x31, 0xf6, // xor esi, esi
        0xe8, 0x00, 0x00, 0x00, 0x00, // call <set_title>
        b'A', b'd', b'o', b'b', b'e', b' ', b'F', b'l', b'a', b's', b'h', //
        b' ', b'P', b'l', b'a', b'y', b'e', b'r', b' ', b'1', b'1', 0x00, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved slack
    ],
    mask: &[
        0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, //
        0xff, 0xff, //
        0xff, 0x00, 0x00, 0x00, 0x00, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    ],
};

/// Classic PowerPC: lis/addi pair loading the title address, bl to the
/// setter, then the inline default title.
const TITLE_PATTERN_PPC_CLASSIC: BytePattern = BytePattern {
    bytes: &[
        0x3c, 0x60, 0x00, 0x00, // lis r3, <hi>
        0x38, 0x63, 0x00, 0x00, // addi r3, r3, <lo>
        0x48, 0x00, 0x00, 0x01, // bl <set_title>
        b'M', b'a', b'c', b'r', b'o', b'm', b'e', b'd', b'i', b'a', //
        b' ', b'P', b'r', b'o', b'j', b'e', b'c', b't', b'o', b'r', 0x00, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, 0x00, // reserved slack
    ],
    mask: &[
        0xff, 0xff, 0x00, 0x00, //
        0xff, 0xff, 0x00, 0x00, //
        0xff, 0x00, 0x00, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
        0xff, 0xff, 0xff, 0xff, 0xff,
    ],
};

// ---------------------------------------------------------------------------
// Variant table
//
// Ordered; first confirmed row wins. Offsets are where each build embeds
// its version string verbatim.
// ---------------------------------------------------------------------------

pub static VARIANTS: &[Variant] = &[
    Variant {
        fingerprint: VariantFingerprint {
            platform: Platform::Windows,
            arch: Arch::X86_64,
            version: "32.0.0.465",
            debug: false,
            signed: true,
            signature_offset: 0x420,
            signature: b"32,0,0,465",
        },
        recipe: PatchRecipe::ResourceEdit(ResourceEdit {
            set_product_name: true,
            set_file_description: true,
            replace_icon: true,
        }),
    },
    Variant {
        fingerprint: VariantFingerprint {
            platform: Platform::Windows,
            arch: Arch::I386,
            version: "9.0.115.0",
            debug: false,
            signed: false,
            signature_offset: 0x420,
            signature: b"9,0,115,0",
        },
        recipe: PatchRecipe::CodePatch(CodePatchRecipe {
            pattern: TITLE_PATTERN_I386_9X,
            blob: BlobId::SetTitleX86Legacy,
            title_policy: TitlePolicy::Truncate(35),
        }),
    },
    Variant {
        fingerprint: VariantFingerprint {
            platform: Platform::Linux,
            arch: Arch::I386,
            version: "9.0.115.0",
            debug: false,
            signed: false,
            signature_offset: 0x210,
            signature: b"9.0.115.0",
        },
        recipe: PatchRecipe::CodePatch(CodePatchRecipe {
            pattern: TITLE_PATTERN_I386_9X,
            blob: BlobId::SetTitleX86Legacy,
            title_policy: TitlePolicy::Truncate(35),
        }),
    },
    Variant {
        fingerprint: VariantFingerprint {
            platform: Platform::Linux,
            arch: Arch::X86_64,
            version: "11.2.202.644",
            debug: false,
            signed: false,
            signature_offset: 0x210,
            signature: b"11.2.202.644",
        },
        recipe: PatchRecipe::CodePatch(CodePatchRecipe {
            pattern: TITLE_PATTERN_X86_64_11X,
            blob: BlobId::SetTitleX86_64,
            title_policy: TitlePolicy::Reject(47),
        }),
    },
    Variant {
        fingerprint: VariantFingerprint {
            platform: Platform::MacOS,
            arch: Arch::X86_64,
            version: "32.0.0.371",
            debug: false,
            signed: true,
            signature_offset: 0x520,
            signature: b"32,0,0,371",
        },
        recipe: PatchRecipe::ResourceEdit(ResourceEdit {
            set_product_name: true,
            set_file_description: false,
            replace_icon: true,
        }),
    },
    Variant {
        fingerprint: VariantFingerprint {
            platform: Platform::MacOS,
            arch: Arch::Ppc,
            version: "9.0.45.0",
            debug: false,
            signed: false,
            signature_offset: 0x100,
            signature: b"9.0.45.0",
        },
        recipe: PatchRecipe::CodePatch(CodePatchRecipe {
            pattern: TITLE_PATTERN_PPC_CLASSIC,
            blob: BlobId::SetTitlePpc,
            title_policy: TitlePolicy::Truncate(35),
        }),
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_recipe_blob_exists_and_fits_its_pattern() {
        for variant in VARIANTS {
            if let PatchRecipe::CodePatch(cp) = &variant.recipe {
                let blob = code_blob(cp.blob, variant.fingerprint.arch)
                    .expect("every code-patch recipe needs a blob for its arch");
                assert!(
                    blob.code.len() <= cp.pattern.len(),
                    "{}: blob must not outgrow the pattern span",
                    variant.fingerprint.version
                );
                assert!(blob.title_offset + blob.title_capacity <= blob.code.len());
                let limit = match cp.title_policy {
                    TitlePolicy::Truncate(n) | TitlePolicy::Reject(n) => n,
                };
                assert!(limit < blob.title_capacity, "limit must leave room for NUL");
            }
        }
    }

    #[test]
    fn patterns_have_matching_masks() {
        for variant in VARIANTS {
            if let PatchRecipe::CodePatch(cp) = &variant.recipe {
                assert_eq!(cp.pattern.bytes.len(), cp.pattern.mask.len());
            }
        }
    }

    #[test]
    fn fingerprints_are_unique() {
        for (i, a) in VARIANTS.iter().enumerate() {
            for b in &VARIANTS[i + 1..] {
                let fa = &a.fingerprint;
                let fb = &b.fingerprint;
                assert!(
                    !(fa.platform == fb.platform
                        && fa.arch == fb.arch
                        && fa.version == fb.version),
                    "duplicate fingerprint {}-{}-{}",
                    fa.platform,
                    fa.arch,
                    fa.version
                );
            }
        }
    }
}

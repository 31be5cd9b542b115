//! # projector-forge
//!
//! Builds self-contained "projector" executables from vendor player
//! binaries: a known player build is fingerprinted, patched (window
//! title, icons, version resources), stripped of its now-invalid code
//! signature, and packaged with the caller's content behind a launcher
//! stub or inside a macOS `.app` bundle.
//!
//! ## Example
//!
//! ```no_run
//! use projector_forge::{build, Arch, BuildRequest, Platform};
//!
//! let request = BuildRequest {
//!     platform: Platform::Linux,
//!     arch: Arch::I386,
//!     version: "9.0.115.0".into(),
//!     player_path: "players/flashplayer-9.0.115.0".into(),
//!     player_sha256: None,
//!     content_path: "movie.swf".into(),
//!     icon_path: None,
//!     title: Some("Night Sky".into()),
//!     output_path: "night-sky".into(),
//! };
//! let launcher = std::fs::read("launchers/linux-i386").unwrap();
//! let report = build(&request, &launcher).unwrap();
//! println!("built {} ({})", report.output_path.display(), report.version);
//! ```
//!
//! Patching is strictly table-driven: an unrecognized player fails the
//! build instead of getting a guessed recipe. See [`variants`] for the
//! fingerprint table and [`error::Error`] for the failure taxonomy.

pub mod assemble;
pub mod code_patch;
pub mod error;
pub mod image;
pub mod launcher;
pub mod macho_bundle;
pub mod pe_resources;
pub mod signature;
pub mod source;
pub mod variants;

pub use assemble::{build, BuildReport, BuildRequest};
pub use code_patch::{BytePattern, CompiledCodeBlob, TitlePolicy};
pub use error::{Error, Result};
pub use image::{Arch, ExecutableImage, Format, Section};
pub use launcher::{LauncherPayload, TRAILER_MAGIC};
pub use variants::{identify, PatchRecipe, Platform, TargetSelector, Variant};

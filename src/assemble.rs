//! Build orchestration: one request in, one projector out.
//!
//! A build owns its inputs end to end: parse the player, confirm the
//! variant, apply the variant's recipe, neutralize signatures, then stage
//! the output. Every byte is written to a temporary location in the
//! destination's parent directory and moved into place only after the
//! whole pipeline succeeds, so a failed build leaves nothing behind.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use tempfile::NamedTempFile;

use crate::code_patch;
use crate::error::{Error, Result};
use crate::image::{Arch, ExecutableImage, Format};
use crate::launcher::{self, LauncherPayload};
use crate::macho_bundle;
use crate::pe_resources;
use crate::signature;
use crate::source;
use crate::variants::{self, PatchRecipe, Platform, TargetSelector};

/// File name the patched player gets inside a trailer or bundle.
const PLAYER_NAME: &str = "player.bin";
/// Icon file name inside a bundle's `Contents/Resources`.
const ICNS_NAME: &str = "app.icns";

/// Everything a caller specifies for one projector build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub platform: Platform,
    pub arch: Arch,
    pub version: String,
    /// The vendor player executable to patch.
    pub player_path: PathBuf,
    /// Optional integrity pin for the player file.
    pub player_sha256: Option<String>,
    /// The movie/content file to package.
    pub content_path: PathBuf,
    /// Replacement icon: `.ico` for PE targets, `.icns` for bundles.
    pub icon_path: Option<PathBuf>,
    /// Window title; defaults to the content file stem.
    pub title: Option<String>,
    pub output_path: PathBuf,
}

/// What a finished build did.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub version: &'static str,
    pub title: String,
    pub title_truncated: bool,
    pub signature_stripped: bool,
    pub output_path: PathBuf,
}

/// Run one build.
///
/// `launcher_stub` is the platform's launcher executable; trailer-based
/// targets get it prepended to the payload, bundle targets get it as
/// `Contents/MacOS/<name>`. PEF targets have no launcher concept and are
/// written flat.
pub fn build(request: &BuildRequest, launcher_stub: &[u8]) -> Result<BuildReport> {
    let player = source::read_verified(&request.player_path, request.player_sha256.as_deref())?;
    let content = fs::read(&request.content_path)?;
    let icon = match &request.icon_path {
        Some(path) => Some(fs::read(path)?),
        None => None,
    };

    let mut image = ExecutableImage::parse(player)?;
    info!(
        "parsed player: {} {} ({} bytes, {} sections)",
        image.format,
        image.arch,
        image.len(),
        image.sections().len()
    );

    let selector = TargetSelector {
        platform: request.platform,
        arch: request.arch,
        version: request.version.clone(),
    };
    let variant = variants::identify(&image, &selector)?;

    let title = request
        .title
        .clone()
        .or_else(|| {
            request
                .content_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "Projector".to_string());

    // Signatures cover the bytes we are about to change.
    let signature_stripped = if variant.fingerprint.signed {
        signature::strip_signature(&mut image)?
    } else {
        false
    };

    let mut title_truncated = false;
    match &variant.recipe {
        PatchRecipe::ResourceEdit(edit) => {
            if image.format == Format::Pe {
                let product = edit.set_product_name.then_some(title.as_str());
                let description = edit.set_file_description.then_some(title.as_str());
                if product.is_some() || description.is_some() {
                    pe_resources::patch_version_strings(&mut image, product, description)?;
                    info!("version strings rewritten");
                }
                if edit.replace_icon {
                    if let Some(ico) = &icon {
                        pe_resources::patch_icon(&mut image, ico)?;
                        info!("icon group replaced");
                    }
                }
            }
            // Mach-O resource edits live in the bundle metadata, written
            // during layout below.
        }
        PatchRecipe::CodePatch(cp) => {
            let blob = variants::code_blob(cp.blob, image.arch).ok_or_else(|| {
                Error::malformed(format!("no compiled blob for {}", image.arch))
            })?;
            let outcome = code_patch::apply(&mut image, &cp.pattern, blob, cp.title_policy, &title)?;
            title_truncated = outcome.truncated;
            info!("title code patched at {:#x}", outcome.offset);
        }
    }

    // A patched Mach-O must carry a valid signature again or the loader
    // kills it on launch.
    if signature_stripped && image.format == Format::MachO {
        signature::adhoc_resign(&mut image, &bundle_identifier(&title))?;
    }

    let content_name = request
        .content_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "content.swf".to_string());

    match (request.platform, image.format) {
        (Platform::MacOS, Format::MachO) => write_bundle(
            request,
            launcher_stub,
            image,
            &title,
            &content_name,
            &content,
            icon.as_deref(),
        )?,
        (_, Format::Pef) => {
            // Classic players load the movie placed next to them; there
            // is no stub to prepend.
            let movie_path = request.output_path.with_file_name(&content_name);
            if movie_path == request.output_path {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "content file name {content_name:?} collides with the output path"
                    ),
                )));
            }
            write_flat_pair(&request.output_path, &image.into_bytes(), &movie_path, &content)?;
        }
        _ => {
            let payload = LauncherPayload {
                title: title.clone(),
                player_name: PLAYER_NAME.to_string(),
                player: image.into_bytes(),
                content_name,
                content,
            };
            let packed = launcher::embed(launcher_stub, &payload)?;
            write_flat(&request.output_path, &packed)?;
        }
    }

    info!("projector written to {}", request.output_path.display());
    Ok(BuildReport {
        version: variant.fingerprint.version,
        title,
        title_truncated,
        signature_stripped,
        output_path: request.output_path.clone(),
    })
}

fn bundle_identifier(title: &str) -> String {
    let slug: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("org.projector-forge.{}", slug.trim_matches('-'))
}

/// Atomically place a flat file at `path` via a sibling tempfile.
fn write_flat(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut staged, bytes)?;
    set_executable(staged.path())?;
    staged
        .persist(path)
        .map_err(|e| Error::Io(e.error))?;
    debug!("staged {} bytes into {}", bytes.len(), path.display());
    Ok(())
}

/// Stage two sibling files and move both into place only after both
/// writes succeed, so a failed write leaves neither behind.
fn write_flat_pair(
    player_path: &Path,
    player: &[u8],
    movie_path: &Path,
    movie: &[u8],
) -> Result<()> {
    let parent = player_path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged_player = NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut staged_player, player)?;
    set_executable(staged_player.path())?;
    let mut staged_movie = NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut staged_movie, movie)?;
    staged_movie
        .persist(movie_path)
        .map_err(|e| Error::Io(e.error))?;
    staged_player
        .persist(player_path)
        .map_err(|e| Error::Io(e.error))?;
    debug!(
        "staged {} + {} bytes into {} and {}",
        player.len(),
        movie.len(),
        player_path.display(),
        movie_path.display()
    );
    Ok(())
}

/// Assemble a `.app` directory next to the destination and rename it in.
fn write_bundle(
    request: &BuildRequest,
    launcher_stub: &[u8],
    image: ExecutableImage,
    title: &str,
    content_name: &str,
    content: &[u8],
    icns: Option<&[u8]>,
) -> Result<()> {
    let output = &request.output_path;
    if output.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", output.display()),
        )));
    }
    let parent = output.parent().unwrap_or_else(|| Path::new("."));
    let app_name = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Projector".to_string());

    let staging = tempfile::TempDir::new_in(parent)?;
    let root = staging.path().join("bundle.app");
    let macos_dir = root.join("Contents/MacOS");
    let resources = root.join("Contents/Resources");
    fs::create_dir_all(&macos_dir)?;
    fs::create_dir_all(&resources)?;

    let exe_path = macos_dir.join(&app_name);
    fs::write(&exe_path, launcher_stub)?;
    set_executable(&exe_path)?;

    let player_path = resources.join(PLAYER_NAME);
    fs::write(&player_path, image.into_bytes())?;
    set_executable(&player_path)?;

    fs::write(resources.join(content_name), content)?;
    let icon_file = if let Some(bytes) = icns {
        fs::write(resources.join(ICNS_NAME), bytes)?;
        ICNS_NAME
    } else {
        ""
    };

    let plist = macho_bundle::plist_template(title, &app_name, icon_file, &request.version);
    fs::write(root.join("Contents/Info.plist"), plist)?;

    fs::rename(&root, output)?;
    debug!("bundle staged as {}", output.display());
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_identifier_is_slugged() {
        assert_eq!(
            bundle_identifier("My Great Game!"),
            "org.projector-forge.my-great-game"
        );
        assert_eq!(bundle_identifier("***"), "org.projector-forge.");
    }

    #[test]
    fn flat_write_is_atomic_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("proj.bin");
        write_flat(&out, b"payload").unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"payload");
        // Only the output lands in the directory; no stray staging files.
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}

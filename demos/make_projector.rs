//! Command-line driver for one projector build.
//!
//! ```text
//! make-projector <platform> <arch> <version> <player> <launcher> <content> <output> \
//!     [--title <title>] [--icon <file>] [--sha256 <hex>]
//! ```

use std::env;
use std::fs;
use std::process;

use projector_forge::{build, Arch, BuildRequest, Platform};

fn print_usage(program: &str) {
    eprintln!(
        "Usage: {program} <platform> <arch> <version> <player> <launcher> <content> <output> [options]"
    );
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  platform   windows | macos | linux");
    eprintln!("  arch       i386 | x86_64 | ppc | ppc64 | ppc970");
    eprintln!("  version    player version, e.g. 9.0.115.0");
    eprintln!("  player     vendor player executable to patch");
    eprintln!("  launcher   launcher stub for the target platform");
    eprintln!("  content    movie file to package");
    eprintln!("  output     destination path (a .app directory on macOS)");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --title <title>   window title (default: content file stem)");
    eprintln!("  --icon <file>     replacement icon (.ico or .icns)");
    eprintln!("  --sha256 <hex>    refuse the player unless its digest matches");
    eprintln!();
    eprintln!("Example:");
    eprintln!(
        "  {program} linux i386 9.0.115.0 ./flashplayer ./stub ./movie.swf ./night-sky --title 'Night Sky'"
    );
}

fn parse_platform(s: &str) -> Option<Platform> {
    match s {
        "windows" => Some(Platform::Windows),
        "macos" => Some(Platform::MacOS),
        "linux" => Some(Platform::Linux),
        _ => None,
    }
}

fn parse_arch(s: &str) -> Option<Arch> {
    match s {
        "i386" => Some(Arch::I386),
        "x86_64" => Some(Arch::X86_64),
        "ppc" => Some(Arch::Ppc),
        "ppc64" => Some(Arch::Ppc64),
        "ppc970" => Some(Arch::Ppc970),
        _ => None,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    if args.len() < 8 {
        print_usage(&args[0]);
        process::exit(1);
    }

    let Some(platform) = parse_platform(&args[1]) else {
        eprintln!("Error: unknown platform '{}'", args[1]);
        print_usage(&args[0]);
        process::exit(1);
    };
    let Some(arch) = parse_arch(&args[2]) else {
        eprintln!("Error: unknown arch '{}'", args[2]);
        print_usage(&args[0]);
        process::exit(1);
    };

    let mut request = BuildRequest {
        platform,
        arch,
        version: args[3].clone(),
        player_path: args[4].clone().into(),
        player_sha256: None,
        content_path: args[6].clone().into(),
        icon_path: None,
        title: None,
        output_path: args[7].clone().into(),
    };

    let mut rest = args[8..].iter();
    while let Some(flag) = rest.next() {
        let value = rest.next().map(String::as_str);
        match (flag.as_str(), value) {
            ("--title", Some(v)) => request.title = Some(v.to_string()),
            ("--icon", Some(v)) => request.icon_path = Some(v.into()),
            ("--sha256", Some(v)) => request.player_sha256 = Some(v.to_string()),
            _ => {
                eprintln!("Error: unknown or incomplete option '{flag}'");
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let launcher = fs::read(&args[5])?;
    let report = build(&request, &launcher)?;

    println!("Built projector: {}", report.output_path.display());
    println!("  variant:  {}", report.version);
    println!("  title:    {}", report.title);
    if report.title_truncated {
        println!("  note:     title was truncated to fit the patch slot");
    }
    if report.signature_stripped {
        println!("  note:     vendor signature removed");
    }

    Ok(())
}

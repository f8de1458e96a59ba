use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=FFMPEG_DIR");
    println!("cargo:rerun-if-env-changed=VCPKG_ROOT");
    println!("cargo:rerun-if-env-changed=VCPKGRS_TRIPLET");

    // Only the FFmpeg-backed source links native libraries.
    if env::var_os("CARGO_FEATURE_FFMPEG").is_none() {
        return;
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "windows" || env::var_os("FFMPEG_DIR").is_some() {
        return;
    }

    let Ok(vcpkg_root) = env::var("VCPKG_ROOT") else {
        println!(
            "cargo:warning=framestep: FFMPEG_DIR is not set. Install FFmpeg via vcpkg or build with --no-default-features for GIF-only input."
        );
        return;
    };

    let triplet = env::var("VCPKGRS_TRIPLET").unwrap_or_else(|_| "x64-windows".to_string());
    let candidate = PathBuf::from(&vcpkg_root).join("installed").join(&triplet);

    if candidate.exists() {
        println!(
            "cargo:warning=framestep: found vcpkg FFmpeg at {}; export FFMPEG_DIR={} to pin it.",
            candidate.display(),
            candidate.display(),
        );
    } else {
        println!(
            "cargo:warning=framestep: VCPKG_ROOT is set but {} does not exist.",
            candidate.display(),
        );
    }
}

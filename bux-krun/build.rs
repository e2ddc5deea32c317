//! Build script for bux-krun.
//!
//! 1. Locates or downloads the pre-built `libkrun` dynamic library.
//! 2. Optionally runs `bindgen` to regenerate the raw binding header (feature `regenerate`).
//! 3. Configures the linker for dynamic linking.
//!
//! # Environment variables
//!
//! - `BUX_DEPS_DIR` — Path to a local directory containing pre-built libraries.
//!   When set, skips downloading. Primary flow for local development.
//!
//! - `BUX_DEPS_VERSION` — Override the deps release version to download.
//!   Defaults to the crate version from `Cargo.toml`.
//!
//! - `BUX_UPDATE_BINDINGS` — When set alongside the `regenerate` feature, the
//!   freshly generated bindings are copied back to `src/sys.rs` so they can
//!   be committed to the repository.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Header URL pinned to a release tag on the containers/libkrun fork.
/// Version **must** match `LIBKRUN_VERSION` in `.github/workflows/deps-build.yml`.
#[cfg(feature = "regenerate")]
const HEADER_URL: &str =
    "https://raw.githubusercontent.com/containers/libkrun/v1.17.4/include/libkrun.h";

/// GitHub repository for downloading pre-built library releases.
const GITHUB_REPO: &str = "qntx/bux";

fn main() {
    println!("cargo:rerun-if-env-changed=BUX_DEPS_DIR");
    println!("cargo:rerun-if-env-changed=BUX_DEPS_VERSION");
    println!("cargo:rerun-if-env-changed=BUX_UPDATE_BINDINGS");
    println!("cargo:rerun-if-env-changed=DOCS_RS");

    // docs.rs: no network, no native libs — pre-generated bindings suffice.
    if env::var("DOCS_RS").is_ok() {
        return;
    }

    let target = env::var("TARGET").expect("TARGET not set");
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));

    #[cfg(feature = "regenerate")]
    {
        let header = download_header(&out_dir);
        generate_bindings(&header, &out_dir);
    }

    let lib_dir = locate_library(&target, &out_dir);
    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=dylib=krun");
}

/// Finds the directory containing `libkrun`'s shared library, downloading a
/// pre-built release if `BUX_DEPS_DIR` is unset.
fn locate_library(target: &str, out_dir: &Path) -> PathBuf {
    if let Ok(dir) = env::var("BUX_DEPS_DIR") {
        return PathBuf::from(dir);
    }

    let version =
        env::var("BUX_DEPS_VERSION").unwrap_or_else(|_| env::var("CARGO_PKG_VERSION").unwrap());
    let dest = out_dir.join("libkrun-deps");
    if dest.join("lib").is_dir() {
        return dest.join("lib");
    }

    let url = format!(
        "https://github.com/{GITHUB_REPO}/releases/download/v{version}/libkrun-{target}.tar.gz"
    );
    match download_and_unpack(&url, &dest) {
        Ok(()) => dest.join("lib"),
        Err(e) => {
            println!(
                "cargo:warning=could not download prebuilt libkrun ({e}); \
                 falling back to system library search path"
            );
            dest
        }
    }
}

fn download_and_unpack(url: &str, dest: &Path) -> Result<(), String> {
    let resp = ureq::get(url).call().map_err(|e| e.to_string())?;
    let reader = resp.into_body().into_reader();
    let decoder = flate2::read::GzDecoder::new(reader);
    let mut archive = tar::Archive::new(decoder);
    fs::create_dir_all(dest).map_err(|e| e.to_string())?;
    archive.unpack(dest).map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(feature = "regenerate")]
fn download_header(out_dir: &Path) -> PathBuf {
    let resp = ureq::get(HEADER_URL).call().expect("fetch libkrun.h");
    let mut body = Vec::new();
    std::io::Read::read_to_end(&mut resp.into_body().into_reader(), &mut body)
        .expect("read libkrun.h");
    let path = out_dir.join("libkrun.h");
    fs::write(&path, body).expect("write libkrun.h");
    path
}

#[cfg(feature = "regenerate")]
fn generate_bindings(header: &Path, out_dir: &Path) {
    let bindings = bindgen::Builder::default()
        .header(header.to_string_lossy())
        .allowlist_function("krun_.*")
        .generate()
        .expect("generate libkrun bindings");

    let generated = out_dir.join("sys.rs");
    bindings
        .write_to_file(&generated)
        .expect("write generated bindings");

    if env::var("BUX_UPDATE_BINDINGS").is_ok() {
        let committed = Path::new(env!("CARGO_MANIFEST_DIR")).join("src/sys.rs");
        fs::copy(&generated, &committed).expect("copy bindings into src/");
    }
}

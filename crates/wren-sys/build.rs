use std::env;
use std::path::{Path, PathBuf};

/// Wren release the bindings are written against.
const WREN_VERSION: &str = "0.4.0";

fn main() {
    println!("cargo:rerun-if-env-changed=WREN_LIB_DIR");
    println!("cargo:rerun-if-env-changed=WREN_SRC_DIR");

    if env::var_os("CARGO_FEATURE_BUNDLED").is_some() {
        build_bundled();
        return;
    }

    if let Some(dir) = env::var_os("WREN_LIB_DIR") {
        println!(
            "cargo:rustc-link-search=native={}",
            Path::new(&dir).display()
        );
    }
    println!("cargo:rustc-link-lib=wren");
}

/// `bundled` compiles a Wren source tree: `$WREN_SRC_DIR` if set, otherwise
/// `vendor/wren` next to this file. Either is the root of a Wren checkout,
/// for example
///
/// ```text
/// git clone --branch 0.4.0 https://github.com/wren-lang/wren crates/wren-sys/vendor/wren
/// ```
fn build_bundled() {
    let root = env::var_os("WREN_SRC_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("vendor/wren"));
    let wren_dir = root.join("src");
    if !wren_dir.join("include").join("wren.h").is_file() {
        panic!(
            "the `bundled` feature needs the Wren {WREN_VERSION} sources, but {} has no src/include/wren.h. \
             Clone https://github.com/wren-lang/wren at tag {WREN_VERSION} into crates/wren-sys/vendor/wren, \
             point WREN_SRC_DIR at a checkout, or drop `bundled` and link a system libwren (WREN_LIB_DIR).",
            root.display()
        );
    }
    let vm_dir = wren_dir.join("vm");
    let optional_dir = wren_dir.join("optional");
    println!("cargo:rerun-if-changed={}", wren_dir.display());

    let mut build = cc::Build::new();
    build
        .include(wren_dir.join("include"))
        .include(&vm_dir)
        .include(&optional_dir)
        .warnings(false);

    for dir in [&vm_dir, &optional_dir] {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => panic!("missing Wren sources in {}: {err}", dir.display()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "c") {
                build.file(path);
            }
        }
    }

    if env::var("PROFILE").as_deref() == Ok("debug") {
        build.define("DEBUG", None);
    }

    build.compile("wren");
}

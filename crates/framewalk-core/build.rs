//! Build script for framewalk-core
//!
//! - Checks the minimum Rust version
//! - Warns on targets other than Linux, where `/proc` and ELF core files are
//!   not available
//! - With the `libunwind` feature, links the system libunwind libraries for
//!   the target architecture
//!
//! ## Requirements
//!
//! - **Rust**: 1.70.0 or newer
//! - **Linux**: x86_64 or aarch64
//! - **libunwind** (feature only): `libunwind-dev` or equivalent, providing
//!   `libunwind-ptrace`, `libunwind-coredump` and `libunwind-<arch>`

use std::env;

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 70, 0);
        if rustc_version < min_rust_version {
            panic!("framewalk-core requires Rust {min_rust_version} or newer, found {rustc_version}");
        }
    } else {
        println!("cargo:warning=could not verify Rust version");
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "linux" {
        println!("cargo:warning=framewalk-core only reads live processes and core files on Linux (target: {target_os})");
    }

    if env::var_os("CARGO_FEATURE_LIBUNWIND").is_some() {
        link_libunwind(&env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default());
    }
}

fn link_libunwind(target_arch: &str)
{
    let arch_library = match target_arch {
        "x86_64" => "unwind-x86_64",
        "aarch64" => "unwind-aarch64",
        other => panic!("the libunwind feature supports x86_64 and aarch64, not {other}"),
    };

    for library in ["unwind-ptrace", "unwind-coredump", arch_library, "unwind"] {
        println!("cargo:rustc-link-lib={library}");
    }
}

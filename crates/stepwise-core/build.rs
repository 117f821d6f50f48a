//! Build script for stepwise-core
//!
//! Checks the toolchain and target before compilation:
//! - Minimum Rust version (1.70, for `let ... else` and `Option::is_some_and`)
//! - Target operating system (live tracing needs Linux `ptrace`)
//! - Target architecture (the bundled ISA backend is x86-64)
//!
//! Other targets still build: the simulated and snapshot inferiors, the
//! breakpoint bookkeeping and the decoder are portable.

fn main()
{
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 70, 0);

        if rustc_version < min_rust_version {
            panic!(
                "stepwise-core requires Rust {} or newer, found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        println!("cargo:warning=could not verify Rust version");
    }

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "linux" {
        println!("cargo:warning=stepwise-core: live process tracing is only available on Linux (target os: {target_os})");
    }

    let target_arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if target_arch != "x86_64" {
        println!("cargo:warning=stepwise-core: only the x86-64 backend can drive a live target (target arch: {target_arch})");
    }
}

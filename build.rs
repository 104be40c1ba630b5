fn main() {
    println!("cargo:rerun-if-env-changed=MUSL_SYSROOT");

    // SpeexDSP is only needed by the ALSA capture backend.
    if std::env::var_os("CARGO_FEATURE_ALSA_CAPTURE").is_none() {
        return;
    }

    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl: statically linked speexdsp from a prepared sysroot, no pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    // ALSA itself is linked by alsa-sys; speexdsp comes from pkg-config.
    if let Err(e) = pkg_config::Config::new().probe("speexdsp") {
        panic!(
            "Failed to find speexdsp ({}). Please install libspeexdsp-dev.",
            e
        );
    }
}

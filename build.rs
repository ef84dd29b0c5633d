//! Build script: links the vendor echo-cancellation library when the
//! `luxaudio` feature is enabled.

fn main() {
    println!("cargo::rerun-if-env-changed=LUXAUDIO_LIB_DIR");

    if std::env::var_os("CARGO_FEATURE_LUXAUDIO").is_none() {
        return;
    }

    // The board image ships the library under /usr/lib; cross builds point
    // LUXAUDIO_LIB_DIR at the sysroot copy.
    if let Ok(dir) = std::env::var("LUXAUDIO_LIB_DIR") {
        println!("cargo::rustc-link-search=native={dir}");
    }
    println!("cargo::rustc-link-lib=dylib=luxaudio");
}

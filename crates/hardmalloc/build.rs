fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());

    if target_os == "linux" || target_os == "android" {
        // Only the hardmalloc symbols leave the shared object.
        let script = format!("{}/linker/version_script.lds", manifest_dir);
        println!("cargo:rustc-cdylib-link-arg=-Wl,--version-script={}", script);
    }
    println!("cargo:rerun-if-changed=linker/version_script.lds");
}

fn main() {
    // ── macOS: Bluetooth permission for the CLI binary ────────────────────────
    //
    // CoreBluetooth keeps CBCentralManager "unauthorised" (every scan finds
    // nothing) unless the process carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription.  A bare CLI has no app bundle, so the
    // plist goes into the __TEXT,__info_plist section of the Mach-O image via
    // the linker's `-sectcreate`.
    //
    // CARGO_CFG_TARGET_OS is the target OS, so cross builds work as well.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset, Info.plist not embedded");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}

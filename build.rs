fn main() {
    // ── macOS + `ble`: embed Info.plist for CoreBluetooth ─────────────────────
    //
    // CBCentralManager stays "unauthorised" (and scanning silently finds
    // nothing) unless the binary carries NSBluetoothAlwaysUsageDescription.
    // A CLI has no bundle, so the plist is linked into the __TEXT,__info_plist
    // section of the Mach-O image instead.
    //
    // Only the `ble` build talks to CoreBluetooth; the simulator build needs
    // nothing here.
    let macos = std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos");
    let ble = std::env::var_os("CARGO_FEATURE_BLE").is_some();
    if !(macos && ble) {
        return;
    }

    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}

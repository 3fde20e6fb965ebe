fn main() {
    // CoreBluetooth refuses to scan from a bare executable unless the binary
    // carries an Info.plist with NSBluetoothAlwaysUsageDescription. Command
    // line tools have no bundle, so the plist is linked into the
    // `__TEXT,__info_plist` section instead.
    //
    // `CARGO_CFG_TARGET_OS` is the target, not the host, so cross builds for
    // macOS pick this up as well.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
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

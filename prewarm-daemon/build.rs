use chrono::Utc;
use std::process::Command;

/// Short hash of the checked-out commit, or "unknown" outside a git checkout.
fn revision() -> String {
    let Ok(output) = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
    else {
        return "unknown".into();
    };
    match String::from_utf8(output.stdout) {
        Ok(hash) if output.status.success() && !hash.trim().is_empty() => hash.trim().into(),
        _ => "unknown".into(),
    }
}

fn main() {
    println!("cargo:rustc-env=PREWARM_REVISION={}", revision());
    println!(
        "cargo:rustc-env=PREWARM_BUILT_AT={}",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    );

    // The repository root sits one level above this crate
    for path in ["../.git/HEAD", "../.git/refs/heads"] {
        println!("cargo:rerun-if-changed={path}");
    }
}

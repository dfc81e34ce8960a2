//! Build script for the FedAvg node
//!
//! Embeds the git revision, build timestamp, target and profile
//! so `fedavg-node version` can identify which build joined a federation.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = git_output(&["rev-parse", "--short=8", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() && !out.stdout.is_empty() => "true",
        Ok(out) if out.status.success() => "false",
        _ => "unknown",
    };

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let rustc_version = Command::new("rustc")
        .arg("--version")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=FEDAVG_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=FEDAVG_GIT_DIRTY={}", git_dirty);
    println!("cargo:rustc-env=FEDAVG_BUILD_TIMESTAMP={}", build_timestamp);
    println!("cargo:rustc-env=FEDAVG_TARGET={}", target);
    println!("cargo:rustc-env=FEDAVG_PROFILE={}", profile);
    println!("cargo:rustc-env=FEDAVG_RUSTC_VERSION={}", rustc_version);
}

/// Run a git command and return its trimmed stdout, or "unknown"
fn git_output(args: &[&str]) -> String {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

//! Build script for pdexec-coord
//!
//! Embeds git revision, build timestamp, target, profile and compiler
//! version so `pdexec-coord version` can report them.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = run("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => (!out.stdout.is_empty()).to_string(),
        _ => "unknown".to_string(),
    };

    let vars = [
        ("PDEXEC_GIT_HASH", git_hash),
        ("PDEXEC_GIT_DIRTY", git_dirty),
        (
            "PDEXEC_BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("PDEXEC_TARGET", env_or_unknown("TARGET")),
        ("PDEXEC_PROFILE", env_or_unknown("PROFILE")),
        ("PDEXEC_RUSTC_VERSION", run("rustc", &["--version"])),
    ];

    for (name, value) in vars {
        println!("cargo:rustc-env={}={}", name, value);
    }
}

/// Run a command and return its trimmed stdout, or "unknown"
fn run(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn env_or_unknown(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| "unknown".to_string())
}

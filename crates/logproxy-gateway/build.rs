use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
}

fn main() {
    // Short commit hash, suffixed with -dirty for uncommitted changes.
    // Reported by GET /health.
    let revision = git(&["describe", "--always", "--dirty", "--abbrev=8"])
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=LOGPROXY_GIT_SHA={revision}");

    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");
}

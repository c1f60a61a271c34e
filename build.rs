use std::process::Command;

/// Trimmed stdout of a successful command.
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Explicit override first (CI builds without a git checkout), then the tool.
fn build_value(env_key: &str, fallback: impl FnOnce() -> Option<String>) -> String {
    println!("cargo:rerun-if-env-changed={env_key}");
    std::env::var(env_key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(fallback)
        .unwrap_or_else(|| "unknown".into())
}

fn main() {
    let timestamp = build_value("JOB_ORDERS_BUILD_TIMESTAMP", || {
        command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]).or_else(|| {
            command_output(
                "powershell",
                &[
                    "-Command",
                    "(Get-Date).ToUniversalTime().ToString('yyyy-MM-ddTHH:mm:ssZ')",
                ],
            )
        })
    });
    println!("cargo:rustc-env=BUILD_TIMESTAMP={timestamp}");

    let git_sha = build_value("JOB_ORDERS_GIT_SHA", || {
        command_output("git", &["rev-parse", "--short", "HEAD"])
    });
    println!("cargo:rustc-env=BUILD_GIT_SHA={git_sha}");

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}

//! Structural tests for layer boundaries.
//!
//! These tests scan source files to verify that the domain stays pure and
//! that backend client crates are only touched by their adapters.

use std::path::{Path, PathBuf};

/// Collect all `.rs` files under a directory recursively.
fn collect_rs_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(collect_rs_files(&path));
            } else if path.extension().and_then(|e| e.to_str()) == Some("rs") {
                files.push(path);
            }
        }
    }
    files
}

/// Read a file and strip comment lines to avoid false positives.
fn read_non_comment_lines(path: &Path) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|l| {
            let trimmed = l.trim();
            !trimmed.starts_with("//") && !trimmed.starts_with("/*") && !trimmed.starts_with('*')
        })
        .map(String::from)
        .collect()
}

fn src_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("src")
}

/// Lines under `dir` (minus `skip`ped subpaths) mentioning any of `needles`.
fn violations(dir: &Path, needles: &[&str], skip: &[&str]) -> Vec<String> {
    let mut found = Vec::new();
    for file in collect_rs_files(dir) {
        let rel = file
            .strip_prefix(env!("CARGO_MANIFEST_DIR"))
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        if skip.iter().any(|s| rel.contains(s)) {
            continue;
        }
        for (i, line) in read_non_comment_lines(&file).iter().enumerate() {
            if needles.iter().any(|n| line.contains(n)) {
                found.push(format!("{rel}:{}: {line}", i + 1));
            }
        }
    }
    found
}

// ── Domain purity ─────────────────────────────────────────────────────────────

#[test]
fn domain_imports_no_outer_layer() {
    let found = violations(
        &src_dir().join("domain"),
        &["crate::application", "crate::infra"],
        &[],
    );
    assert!(
        found.is_empty(),
        "domain/ must not depend on application/ or infra/:\n{}",
        found.join("\n")
    );
}

#[test]
fn domain_performs_no_io() {
    let found = violations(
        &src_dir().join("domain"),
        &["tokio::", "std::fs", "std::net", "reqwest", "bollard"],
        &[],
    );
    assert!(
        found.is_empty(),
        "domain/ must stay free of I/O:\n{}",
        found.join("\n")
    );
}

// ── Application boundaries ────────────────────────────────────────────────────

#[test]
fn application_imports_no_infra() {
    let found = violations(&src_dir().join("application"), &["crate::infra"], &[]);
    assert!(
        found.is_empty(),
        "application/ must reach infra only through ports:\n{}",
        found.join("\n")
    );
}

#[test]
fn backend_clients_stay_in_their_adapters() {
    let found = violations(&src_dir(), &["bollard::"], &["/infra/swarm/"]);
    assert!(
        found.is_empty(),
        "bollard is only used by infra/swarm:\n{}",
        found.join("\n")
    );

    let found = violations(&src_dir(), &["reqwest::"], &["/infra/"]);
    assert!(
        found.is_empty(),
        "reqwest is only used by infra/:\n{}",
        found.join("\n")
    );
}

//! Commands run inside app instances.

use std::collections::BTreeMap;

use super::app::ImageMetadata;
use super::error::ProvisionError;

/// Where deployed code lives inside an app image.
pub const APP_DIR: &str = "/home/application/current";

/// Where an uploaded or downloaded archive is staged before deploy.
pub const ARCHIVE_PATH: &str = "/home/application/archive.tar.gz";

/// Deploy agent shipped in every platform image.
pub const DEPLOY_AGENT: &str = "/var/lib/convoy/deploy";

/// Print the first Procfile found in the usual places.
#[must_use]
pub fn procfile_command() -> Vec<String> {
    shell(&format!(
        "cat {APP_DIR}/Procfile || cat /app/user/Procfile || cat /Procfile"
    ))
}

/// Long-running command for `process`, run from the app directory.
///
/// # Errors
///
/// Returns `NotFound` when the image declares no such process.
pub fn process_command(meta: &ImageMetadata, process: &str) -> Result<Vec<String>, ProvisionError> {
    let cmd = meta
        .processes
        .get(process)
        .ok_or_else(|| ProvisionError::NotFound {
            kind: "process",
            name: process.to_string(),
        })?;
    Ok(shell(&format!(
        "[ -d {APP_DIR} ] && cd {APP_DIR}; exec {cmd}"
    )))
}

/// Fetch an archive and hand it to the deploy agent.
#[must_use]
pub fn archive_deploy_command(archive_url: &str) -> Vec<String> {
    shell(&format!(
        "curl -fsSL -o {ARCHIVE_PATH} '{archive_url}' && {DEPLOY_AGENT} archive file://{ARCHIVE_PATH}"
    ))
}

/// Read an archive from stdin and hand it to the deploy agent.
#[must_use]
pub fn upload_deploy_command() -> Vec<String> {
    shell(&format!(
        "cat > {ARCHIVE_PATH} && {DEPLOY_AGENT} archive file://{ARCHIVE_PATH}"
    ))
}

/// Batch command with arguments, through a login shell.
#[must_use]
pub fn run_command(cmd: &str, args: &[String]) -> Vec<String> {
    let mut line = cmd.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    shell(&line)
}

/// Interactive login shell.
#[must_use]
pub fn shell_command(term: &str) -> Vec<String> {
    let mut cmd = vec!["/usr/bin/env".to_string()];
    if !term.is_empty() {
        cmd.push(format!("TERM={term}"));
    }
    cmd.extend(["bash".to_string(), "-l".to_string()]);
    cmd
}

fn shell(line: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-lc".to_string(), line.to_string()]
}

/// Parse `name: command` lines. Blank lines, comments and lines with an
/// invalid process name are skipped.
#[must_use]
pub fn parse_procfile(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(name, cmd)| (name.trim(), cmd.trim()))
        .filter(|(name, cmd)| {
            !name.is_empty()
                && !cmd.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
        .map(|(name, cmd)| (name.to_string(), cmd.to_string()))
        .collect()
}

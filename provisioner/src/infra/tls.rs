//! Node TLS material: validation, on-disk materialization for clients that
//! only take file paths, and reqwest identities.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::application::ports::NodeCredentials;

/// PEM files written to a private temporary directory. The files are
/// deleted when this value is dropped.
#[derive(Debug)]
pub struct TlsFiles {
    dir: tempfile::TempDir,
}

impl TlsFiles {
    pub fn ca(&self) -> PathBuf {
        self.dir.path().join("ca.pem")
    }

    pub fn cert(&self) -> PathBuf {
        self.dir.path().join("cert.pem")
    }

    pub fn key(&self) -> PathBuf {
        self.dir.path().join("key.pem")
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Check that `creds` hold at least one CA certificate, one client
/// certificate and a private key.
///
/// # Errors
///
/// Returns an error naming the first part that does not parse.
pub fn validate(creds: &NodeCredentials) -> Result<()> {
    let ca = rustls_pemfile::certs(&mut BufReader::new(creds.ca_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse CA cert")?;
    anyhow::ensure!(!ca.is_empty(), "no CA certificate found");

    let certs = rustls_pemfile::certs(&mut BufReader::new(creds.cert_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse client cert")?;
    anyhow::ensure!(!certs.is_empty(), "no client certificate found");

    rustls_pemfile::private_key(&mut BufReader::new(creds.key_pem.as_slice()))
        .context("failed to parse client key")?
        .context("no private key found")?;
    Ok(())
}

/// Validate `creds` and write them as `ca.pem`, `cert.pem` and `key.pem`.
///
/// # Errors
///
/// Returns an error if the material is invalid or cannot be written.
pub fn write_files(creds: &NodeCredentials) -> Result<TlsFiles> {
    validate(creds)?;
    let dir = tempfile::tempdir().context("creating temp dir for node credentials")?;
    let files = TlsFiles { dir };
    std::fs::write(files.ca(), &creds.ca_pem).context("writing CA cert")?;
    std::fs::write(files.cert(), &creds.cert_pem).context("writing client cert")?;
    std::fs::write(files.key(), &creds.key_pem).context("writing client key")?;
    Ok(files)
}

/// Apply `creds` as trusted root and client identity.
///
/// # Errors
///
/// Returns an error if the material is invalid.
pub fn configure_reqwest(
    builder: reqwest::ClientBuilder,
    creds: &NodeCredentials,
) -> Result<reqwest::ClientBuilder> {
    validate(creds)?;
    let ca = reqwest::Certificate::from_pem(&creds.ca_pem).context("loading CA cert")?;
    let mut identity_pem = creds.cert_pem.clone();
    if !identity_pem.ends_with(b"\n") {
        identity_pem.push(b'\n');
    }
    identity_pem.extend_from_slice(&creds.key_pem);
    let identity = reqwest::Identity::from_pem(&identity_pem).context("loading client identity")?;
    Ok(builder
        .use_rustls_tls()
        .add_root_certificate(ca)
        .identity(identity))
}

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MtlsError {
    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rcgen::Error> for MtlsError {
    fn from(e: rcgen::Error) -> Self {
        MtlsError::Generation(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Paths of a generated per-session certificate bundle.
#[derive(Debug, Clone)]
pub struct MtlsBundle {
    pub bundle_dir: PathBuf,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl MtlsBundle {
    /// Tagged reference persisted on the exec session row.
    pub fn cert_ref(&self) -> Value {
        json!({
            "kind": "file",
            "ca_path": self.ca_path.to_string_lossy(),
            "cert_path": self.cert_path.to_string_lossy(),
            "key_path": self.key_path.to_string_lossy(),
        })
    }
}

const VALIDITY_DAYS: i64 = 365;

/// Generate a fresh CA + server certificate + private key for one exec
/// session, written 0600 under `<cert_base>/<session_id>/`.
///
/// In placeholder mode the three files hold marker text instead of PEM;
/// everything else (paths, permissions) behaves identically. Any partial
/// files are removed when generation fails.
pub fn generate_bundle(
    cert_base: &Path,
    session_id: &str,
    placeholder: bool,
) -> Result<MtlsBundle, MtlsError> {
    let bundle_dir = cert_base.join(session_id);
    std::fs::create_dir_all(&bundle_dir)?;

    let bundle = MtlsBundle {
        ca_path: bundle_dir.join("ca.crt"),
        cert_path: bundle_dir.join("server.crt"),
        key_path: bundle_dir.join("server.key"),
        bundle_dir,
    };

    let result = if placeholder {
        write_placeholders(&bundle, session_id)
    } else {
        generate_and_write(&bundle, session_id)
    };

    if let Err(e) = result {
        for path in [&bundle.ca_path, &bundle.cert_path, &bundle.key_path] {
            if let Err(rm) = std::fs::remove_file(path) {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to remove partial bundle file {:?}: {}", path, rm);
                }
            }
        }
        return Err(e);
    }

    Ok(bundle)
}

fn write_placeholders(bundle: &MtlsBundle, session_id: &str) -> Result<(), MtlsError> {
    for path in [&bundle.ca_path, &bundle.cert_path, &bundle.key_path] {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        write_private(path, format!("generated-for-{session_id}-{name}\n").as_bytes())?;
    }
    Ok(())
}

fn generate_and_write(bundle: &MtlsBundle, session_id: &str) -> Result<(), MtlsError> {
    let not_before = OffsetDateTime::now_utc() - Duration::minutes(1);
    let not_after = OffsetDateTime::now_utc() + Duration::days(VALIDITY_DAYS);

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::OrganizationName, "mcp-console");
    ca_dn.push(DnType::CommonName, "mcp-console-ca");
    ca_params.distinguished_name = ca_dn;
    ca_params.not_before = not_before;
    ca_params.not_after = not_after;

    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut server_params = CertificateParams::new(vec![
        "localhost".to_string(),
        format!("mcp-session-{session_id}"),
        session_id.to_string(),
    ])?;
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::OrganizationName, "mcp-console");
    server_dn.push(DnType::CommonName, format!("mcp-session-{session_id}"));
    server_params.distinguished_name = server_dn;
    server_params.not_before = not_before;
    server_params.not_after = not_after;

    let server_key = KeyPair::generate()?;
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

    write_private(&bundle.key_path, server_key.serialize_pem().as_bytes())?;
    write_private(&bundle.cert_path, server_cert.pem().as_bytes())?;
    write_private(&bundle.ca_path, ca_cert.pem().as_bytes())?;
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<(), MtlsError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    // An existing file keeps its old mode; force it back down.
    let mut perms = file.metadata()?.permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<(), MtlsError> {
    std::fs::write(path, contents)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Certificate Authority management for TLS interception.
//!
//! Loads (or, on request, generates) the root CA used to sign per-host leaf
//! certificates for intercepted CONNECT sessions.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use hudsucker::rustls::pki_types::CertificateDer;

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "package-proxy-ca.pem";
const CA_KEY_FILENAME: &str = "package-proxy-ca.key";

const CA_COMMON_NAME: &str = "Package Proxy CA";

/// A loaded CA key pair, ready to sign leaf certificates.
pub struct LoadedCa {
    /// CA certificate in PEM form, as served to clients.
    pub cert_pem: String,
    /// CA certificate in DER form, appended to every leaf chain.
    pub cert_der: CertificateDer<'static>,
    /// Signing half of the CA.
    pub issuer: Issuer<'static, KeyPair>,
}

impl std::fmt::Debug for LoadedCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedCa")
            .field("cert_der_len", &self.cert_der.len())
            .field("issuer", &"Issuer")
            .finish()
    }
}

impl LoadedCa {
    /// Parses a CA from its certificate and private key PEM.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaManagerError> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaManagerError::Parse("no certificate in PEM".into()))?
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert_der,
            issuer,
        })
    }

    /// Generates a throwaway CA that only lives in memory.
    pub fn ephemeral() -> Result<Self, CaManagerError> {
        let (cert_pem, key_pem) = generate_ca_pem()?;
        Self::from_pem(&cert_pem, &key_pem)
    }
}

/// Builds a self-signed root CA, returning certificate and key PEM.
fn generate_ca_pem() -> Result<(String, String), CaManagerError> {
    let key_pair = KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, CA_COMMON_NAME);
    name.push(DnType::OrganizationName, "Package Proxy");
    params.distinguished_name = name;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CaManagerError::Generation(e.to_string()))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Locates, generates and loads the interception CA.
#[derive(Debug, Clone)]
pub struct CaManager {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CaManager {
    /// Creates a CA manager using the default file names inside `ca_dir`.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        let ca_dir = ca_dir.as_ref();
        Self::from_paths(ca_dir.join(CA_CERT_FILENAME), ca_dir.join(CA_KEY_FILENAME))
    }

    /// Creates a CA manager for explicit certificate and key paths.
    pub fn from_paths(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Creates a CA manager using the default data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        Ok(Self::new(Self::default_dir()?))
    }

    /// Returns `<data dir>/ca`.
    pub fn default_dir() -> Result<PathBuf, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("", "package-proxy", "PackageProxy")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;
        Ok(project_dirs.data_dir().join("ca"))
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Checks if both CA files exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }

    /// Loads the CA, generating it first if either file is missing.
    pub fn ensure_ca(&self) -> Result<LoadedCa, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load()
    }

    /// Generates a new root CA and writes both files.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        for path in [&self.cert_path, &self.key_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }

        let (cert_pem, key_pem) = generate_ca_pem()?;
        fs::write(&self.cert_path, &cert_pem).map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(&self.key_path, &key_pem).map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path);
        Ok(())
    }

    /// Loads an existing CA. Missing files are an error.
    pub fn load(&self) -> Result<LoadedCa, CaManagerError> {
        if !self.ca_exists() {
            return Err(CaManagerError::Missing(format!(
                "{} / {}",
                self.cert_path.display(),
                self.key_path.display()
            )));
        }

        let cert_pem = fs::read_to_string(&self.cert_path)?;
        let key_pem = fs::read_to_string(&self.key_path)?;
        LoadedCa::from_pem(&cert_pem, &key_pem)
    }

    /// Reads the CA certificate PEM.
    pub fn read_cert_pem(&self) -> Result<String, CaManagerError> {
        Ok(fs::read_to_string(&self.cert_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ca_manager_paths() {
        let manager = CaManager::new("/tmp/test-ca");
        assert_eq!(
            manager.cert_path(),
            Path::new("/tmp/test-ca/package-proxy-ca.pem")
        );
        assert_eq!(
            manager.key_path(),
            Path::new("/tmp/test-ca/package-proxy-ca.key")
        );
    }

    #[test]
    fn ca_manager_not_exists_initially() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());
    }

    #[test]
    fn ca_manager_load_missing_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        let err = manager.load().unwrap_err();
        assert!(matches!(err, CaManagerError::Missing(_)));
        assert!(!manager.ca_exists());
    }

    #[test]
    fn ca_manager_generate_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.generate_ca().unwrap();
        assert!(manager.ca_exists());

        let ca = manager.load().unwrap();
        assert!(ca.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(!ca.cert_der.is_empty());
        assert_eq!(manager.read_cert_pem().unwrap(), ca.cert_pem);
    }

    #[test]
    fn ca_manager_ensure_ca_generates_if_missing() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::from_paths(
            temp_dir.path().join("certs/ca.pem"),
            temp_dir.path().join("keys/ca.key"),
        );

        assert!(manager.ensure_ca().is_ok());
        assert!(manager.ca_exists());
    }

    #[test]
    fn ca_manager_ensure_ca_keeps_existing() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.generate_ca().unwrap();
        let first = manager.read_cert_pem().unwrap();

        manager.ensure_ca().unwrap();
        assert_eq!(manager.read_cert_pem().unwrap(), first);
    }

    #[test]
    fn corrupt_key_fails_to_parse() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.generate_ca().unwrap();
        fs::write(manager.key_path(), "not a key").unwrap();

        assert!(matches!(manager.load(), Err(CaManagerError::Parse(_))));
    }

    #[test]
    fn ephemeral_ca_loads() {
        let ca = LoadedCa::ephemeral().unwrap();
        assert!(!ca.cert_der.is_empty());
    }
}

//! Filesystem-backed certificate authority.
//!
//! Layout under the state directory:
//!
//! ```text
//! <state>/pki/ca.crt            root certificate
//! <state>/pki/ca.key            root private key
//! <state>/pki/issued/<name>.crt
//! <state>/pki/issued/<name>.key
//! ```
//!
//! The root is generated on first use. Issuance is idempotent by name: an
//! existing pair is returned as-is, so certificates are stable across runs.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use tracing::info;

use super::atomic_write;
use crate::error::{Error, Result};

const ROOT_COMMON_NAME: &str = "kubernetes-ca";

/// An issued certificate/private-key pair, PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedPair {
    pub certificate: String,
    pub private_key: String,
}

/// Filesystem CA store rooted at `<state>/pki`.
pub struct CaStore {
    dir: PathBuf,
}

fn pki_err(context: &str, err: rcgen::Error) -> Error {
    Error::Store(format!("{context}: {err}"))
}

impl CaStore {
    /// Open (creating directories as needed) the store at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir.join("issued"))?;
        Ok(CaStore {
            dir: dir.to_path_buf(),
        })
    }

    fn issued_path(&self, name: &str, ext: &str) -> PathBuf {
        self.dir.join("issued").join(format!("{name}.{ext}"))
    }

    /// The root certificate in PEM form, generating the root if absent.
    pub fn root_certificate(&self) -> Result<String> {
        let (pem, _) = self.ensure_root()?;
        Ok(pem)
    }

    /// Load the root pair, generating and persisting it on first use.
    fn ensure_root(&self) -> Result<(String, String)> {
        let cert_path = self.dir.join("ca.crt");
        let key_path = self.dir.join("ca.key");

        if cert_path.exists() && key_path.exists() {
            return Ok((
                fs::read_to_string(&cert_path)?,
                fs::read_to_string(&key_path)?,
            ));
        }

        info!("generating new certificate authority");
        let key = KeyPair::generate().map_err(|e| pki_err("error generating CA key", e))?;
        let mut params = CertificateParams::new(Vec::new())
            .map_err(|e| pki_err("error building CA params", e))?;
        params
            .distinguished_name
            .push(DnType::CommonName, ROOT_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params
            .self_signed(&key)
            .map_err(|e| pki_err("error self-signing CA certificate", e))?;

        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();
        atomic_write(&key_path, key_pem.as_bytes())?;
        atomic_write(&cert_path, cert_pem.as_bytes())?;
        Ok((cert_pem, key_pem))
    }

    /// Rebuild signing state from the persisted root.
    fn signing_root(&self) -> Result<(Certificate, KeyPair)> {
        let (cert_pem, key_pem) = self.ensure_root()?;
        let key =
            KeyPair::from_pem(&key_pem).map_err(|e| pki_err("error loading CA key", e))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| pki_err("error loading CA certificate", e))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| pki_err("error rebuilding CA certificate", e))?;
        Ok((cert, key))
    }

    /// Fetch an issued pair by name.
    pub fn get(&self, name: &str) -> Result<Option<IssuedPair>> {
        let cert_path = self.issued_path(name, "crt");
        let key_path = self.issued_path(name, "key");
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        Ok(Some(IssuedPair {
            certificate: fs::read_to_string(cert_path)?,
            private_key: fs::read_to_string(key_path)?,
        }))
    }

    /// Issue a certificate for `name`, returning the existing pair when one
    /// is already on disk.
    pub fn issue(&self, name: &str, alt_names: &[String]) -> Result<IssuedPair> {
        if let Some(existing) = self.get(name)? {
            return Ok(existing);
        }

        info!(name, "issuing certificate");
        let (ca_cert, ca_key) = self.signing_root()?;

        let key = KeyPair::generate().map_err(|e| pki_err("error generating key", e))?;
        let mut params = CertificateParams::new(alt_names.to_vec())
            .map_err(|e| pki_err("error building certificate params", e))?;
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params
            .signed_by(&key, &ca_cert, &ca_key)
            .map_err(|e| pki_err("error signing certificate", e))?;

        let pair = IssuedPair {
            certificate: cert.pem(),
            private_key: key.serialize_pem(),
        };
        atomic_write(&self.issued_path(name, "key"), pair.private_key.as_bytes())?;
        atomic_write(&self.issued_path(name, "crt"), pair.certificate.as_bytes())?;
        Ok(pair)
    }

    /// Names of all issued certificates, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.dir.join("issued"))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("crt") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

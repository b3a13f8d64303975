use std::fs;
use std::path::{Path, PathBuf};

use axum_server::tls_rustls::RustlsConfig;
use common_auth::{AuthError, AuthResult};
use tracing::info;
use zeroize::Zeroizing;

use crate::config::TlsConfig;

const PRIVATE_KEY_TAGS: &[&str] = &["PRIVATE KEY", "RSA PRIVATE KEY", "EC PRIVATE KEY"];

/// Server certificate chain and private key, both PEM. Loaded once at startup.
pub struct TlsCertificate {
    cert: Vec<u8>,
    key: Zeroizing<Vec<u8>>,
    certificate_count: usize,
}

impl TlsCertificate {
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert
    }

    pub fn certificate_count(&self) -> usize {
        self.certificate_count
    }

    pub async fn rustls_config(&self) -> AuthResult<RustlsConfig> {
        RustlsConfig::from_pem(self.cert.clone(), self.key.to_vec())
            .await
            .map_err(|err| AuthError::TlsLoad(format!("rejected by rustls: {err}")))
    }
}

/// Reads the certificate/key pair from disk.
pub struct TlsKeyProvider {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl TlsKeyProvider {
    pub fn new(config: &TlsConfig) -> Self {
        Self {
            cert_path: config.cert_path.clone(),
            key_path: config.key_path.clone(),
        }
    }

    pub fn load(&self) -> AuthResult<TlsCertificate> {
        let cert = read(&self.cert_path)?;
        let key = Zeroizing::new(read(&self.key_path)?);

        let certs = pem::parse_many(&cert).map_err(|err| {
            AuthError::TlsLoad(format!("{} is not PEM: {err}", self.cert_path.display()))
        })?;
        let certificate_count = certs
            .iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .count();
        if certificate_count == 0 {
            return Err(AuthError::TlsLoad(format!(
                "{} contains no certificate",
                self.cert_path.display()
            )));
        }

        let keys = pem::parse_many(key.as_slice()).map_err(|err| {
            AuthError::TlsLoad(format!("{} is not PEM: {err}", self.key_path.display()))
        })?;
        let private_keys = keys
            .iter()
            .filter(|block| PRIVATE_KEY_TAGS.contains(&block.tag()))
            .count();
        if private_keys != 1 {
            return Err(AuthError::TlsLoad(format!(
                "{} must contain exactly one private key, found {private_keys}",
                self.key_path.display()
            )));
        }

        info!(
            cert = %self.cert_path.display(),
            certificates = certificate_count,
            "Loaded TLS certificate"
        );
        Ok(TlsCertificate {
            cert,
            key,
            certificate_count,
        })
    }
}

fn read(path: &Path) -> AuthResult<Vec<u8>> {
    let bytes = fs::read(path)
        .map_err(|err| AuthError::TlsLoad(format!("cannot read {}: {err}", path.display())))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(AuthError::TlsLoad(format!("{} is empty", path.display())));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pem::Pem;
    use tempfile::{tempdir, TempDir};

    fn provider_with(cert: &str, key: &str) -> (TempDir, TlsKeyProvider) {
        let dir = tempdir().expect("tempdir");
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        fs::write(&cert_path, cert).expect("write cert");
        fs::write(&key_path, key).expect("write key");
        let provider = TlsKeyProvider::new(&TlsConfig {
            cert_path,
            key_path,
        });
        (dir, provider)
    }

    fn block(tag: &str) -> String {
        pem::encode(&Pem::new(tag, vec![0x30, 0x03, 0x02, 0x01, 0x01]))
    }

    #[test]
    fn loads_certificate_chain_and_key() {
        let chain = format!("{}{}", block("CERTIFICATE"), block("CERTIFICATE"));
        let (_dir, provider) = provider_with(&chain, &block("PRIVATE KEY"));

        let loaded = provider.load().expect("load");
        assert_eq!(loaded.certificate_count(), 2);
        assert_eq!(loaded.cert_pem(), chain.as_bytes());
    }

    #[test]
    fn missing_files_fail() {
        let dir = tempdir().expect("tempdir");
        let provider = TlsKeyProvider::new(&TlsConfig {
            cert_path: dir.path().join("absent.pem"),
            key_path: dir.path().join("absent-key.pem"),
        });
        let err = provider.load().err().expect("must fail");
        assert!(matches!(err, AuthError::TlsLoad(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn key_file_without_private_key_fails() {
        let (_dir, provider) = provider_with(&block("CERTIFICATE"), &block("CERTIFICATE"));
        let err = provider.load().err().expect("must fail");
        assert!(err.to_string().contains("exactly one private key"));
    }

    #[test]
    fn empty_or_garbage_material_fails() {
        let (_dir, provider) = provider_with("   \n", &block("PRIVATE KEY"));
        assert!(matches!(provider.load(), Err(AuthError::TlsLoad(_))));

        let (_dir, provider) = provider_with(&block("PUBLIC KEY"), &block("PRIVATE KEY"));
        assert!(matches!(provider.load(), Err(AuthError::TlsLoad(_))));
    }
}

//! Certificates for the HTTPS listener
//!
//! The HTTPS listener only ever asks one question: which certificate to present
//! for a given SNI name. [`SniCertResolver`] answers it from a directory of PEM
//! pairs named after the hosts they cover, falling back to parent domains and
//! then to a default certificate.

use rcgen::{generate_simple_self_signed, CertifiedKey as GeneratedCert};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const CERT_EXTENSION: &str = "crt";
const KEY_EXTENSION: &str = "key";
const DEFAULT_NAME: &str = "default";

/// Error type for certificate loading
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),
    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("unsupported private key in {}: {reason}", path.display())]
    BadKey { path: PathBuf, reason: String },
    #[error("failed to generate self-signed certificate: {0}")]
    SelfSigned(String),
    #[error("no certificates found in directory {}", .0.display())]
    EmptyDirectory(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TlsError + '_ {
    move |source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(path))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }

    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(io_error(path))? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Load a certificate chain and its key into a signing-ready pair
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    certified_key(certs, key, key_path)
}

fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    key_path: &Path,
) -> Result<Arc<CertifiedKey>, TlsError> {
    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| TlsError::BadKey {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Generate a throwaway certificate for localhost
pub fn self_signed() -> Result<Arc<CertifiedKey>, TlsError> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let GeneratedCert { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| TlsError::SelfSigned(e.to_string()))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| TlsError::SelfSigned(e.to_string()))?;

    certified_key(vec![cert_der], key_der, Path::new("<generated>"))
}

/// Picks a certificate by SNI name
#[derive(Default)]
pub struct SniCertResolver {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl SniCertResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver presenting one certificate for every name
    pub fn single(cert: Arc<CertifiedKey>) -> Self {
        Self {
            by_name: HashMap::new(),
            default: Some(cert),
        }
    }

    /// Load every `<name>.crt` + `<name>.key` pair in `dir`.
    ///
    /// `default.crt`/`default.key` becomes the fallback certificate. A
    /// certificate without its key is skipped with a warning.
    pub fn from_dir(dir: &Path) -> Result<Self, TlsError> {
        let mut resolver = Self::new();

        for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
            let cert_path = entry.map_err(io_error(dir))?.path();
            if cert_path.extension().and_then(|e| e.to_str()) != Some(CERT_EXTENSION) {
                continue;
            }
            let name = match cert_path.file_stem().and_then(|s| s.to_str()) {
                Some(n) => n.to_ascii_lowercase(),
                None => continue,
            };

            let key_path = cert_path.with_extension(KEY_EXTENSION);
            if !key_path.is_file() {
                warn!(cert = %cert_path.display(), "Certificate has no matching key, skipping");
                continue;
            }

            let cert = load_certified_key(&cert_path, &key_path)?;
            debug!(name = %name, cert = %cert_path.display(), "Loaded certificate");

            if name == DEFAULT_NAME {
                resolver.default = Some(cert);
            } else {
                resolver.insert(&name, cert);
            }
        }

        if resolver.is_empty() {
            return Err(TlsError::EmptyDirectory(dir.to_path_buf()));
        }

        info!(
            dir = %dir.display(),
            names = resolver.by_name.len(),
            has_default = resolver.default.is_some(),
            "Certificates loaded"
        );
        Ok(resolver)
    }

    pub fn insert(&mut self, name: &str, cert: Arc<CertifiedKey>) {
        self.by_name.insert(name.to_ascii_lowercase(), cert);
    }

    pub fn set_default(&mut self, cert: Arc<CertifiedKey>) {
        self.default = Some(cert);
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty() && self.default.is_none()
    }

    /// Certificate for `name`: exact entry, then the closest parent domain,
    /// then the default.
    pub fn resolve_name(&self, name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = name {
            let name = name.to_ascii_lowercase();
            let mut candidate = name.as_str();
            loop {
                if let Some(cert) = self.by_name.get(candidate) {
                    return Some(Arc::clone(cert));
                }
                match candidate.split_once('.') {
                    Some((_, parent)) if !parent.is_empty() => candidate = parent,
                    _ => break,
                }
            }
        }

        self.default.clone()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name();
        let cert = self.resolve_name(name);
        if cert.is_none() {
            debug!(sni = ?name, "No certificate for server name");
        }
        cert
    }
}

/// Build a TLS acceptor advertising HTTP/2 and HTTP/1.1
pub fn acceptor(resolver: SniCertResolver) -> TlsAcceptor {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

//! Certificate store and SNI based certificate selection.
//!
//! Certificates are looked up by convention: for a domain `example.com` the
//! chain is read from `<certs_dir>/example.com.pem` and the private key from
//! `<certs_dir>/example.com.key`. Loading is all or nothing.
use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ServerConfig,
    crypto::aws_lc_rs,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("no certificate domains configured")]
    NoDomains,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("unusable private key in {path}: {source}")]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("failed to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// All certificates presented by the TLS listener.
#[derive(Debug)]
pub struct CertificateStore {
    certs: HashMap<String, Arc<CertifiedKey>>,
    default_cert: Arc<CertifiedKey>,
}

impl CertificateStore {
    /// Certificate and key paths for `domain`.
    pub fn cert_paths(certs_dir: &Path, domain: &str) -> (PathBuf, PathBuf) {
        (
            certs_dir.join(format!("{domain}.pem")),
            certs_dir.join(format!("{domain}.key")),
        )
    }

    /// Load one certificate per domain. Fails on the first domain that
    /// cannot be loaded; the first domain's certificate is the default.
    pub fn load<S: AsRef<str>>(
        domains: &[S],
        certs_dir: impl AsRef<Path>,
    ) -> Result<Self, CertificateError> {
        let certs_dir = certs_dir.as_ref();
        let mut certs = HashMap::with_capacity(domains.len());
        let mut default_cert = None;

        for domain in domains {
            let domain = domain.as_ref().to_ascii_lowercase();
            let (cert_path, key_path) = Self::cert_paths(certs_dir, &domain);
            let certified = Arc::new(load_certified_key(&cert_path, &key_path)?);
            tracing::info!("Loaded certificate for {} from {}", domain, cert_path.display());

            default_cert.get_or_insert_with(|| certified.clone());
            certs.insert(domain, certified);
        }

        let default_cert = default_cert.ok_or(CertificateError::NoDomains)?;
        Ok(Self {
            certs,
            default_cert,
        })
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.certs.contains_key(&domain.to_ascii_lowercase())
    }

    /// Certificate for a server name: exact match, then the `*.parent`
    /// wildcard entry, then the default certificate.
    pub fn lookup(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        let Some(name) = server_name.map(str::to_ascii_lowercase) else {
            return self.default_cert.clone();
        };

        if let Some(cert) = self.certs.get(&name) {
            return cert.clone();
        }
        let wildcard = name
            .split_once('.')
            .and_then(|(_, parent)| self.certs.get(&format!("*.{parent}")));
        if let Some(cert) = wildcard {
            return cert.clone();
        }

        tracing::debug!("No certificate for SNI {}, using default", name);
        self.default_cert.clone()
    }

    /// Build the rustls server configuration (TLS 1.2/1.3, ALPN h2 + http/1.1).
    pub fn into_server_config(self) -> Result<ServerConfig, CertificateError> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(self));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.lookup(client_hello.server_name()))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CertificateError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertificateError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, CertificateError> {
    let cert_chain = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if cert_chain.is_empty() {
        return Err(CertificateError::NoCertificate(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| CertificateError::Io {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertificateError::NoPrivateKey(key_path.to_path_buf()))?;

    let signing_key =
        aws_lc_rs::sign::any_supported_type(&key).map_err(|source| CertificateError::InvalidKey {
            path: key_path.to_path_buf(),
            source,
        })?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

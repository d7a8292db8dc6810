//! Local certificate authority
//!
//! Loads or generates the root CA used to impersonate origins, mints
//! per-host leaf certificates, and caches the minted material for the
//! dynamic TLS server.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;

use crate::error::{Error, Result};

/// Leaf validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live in seconds (half the leaf validity)
const CACHE_TTL: u64 = (TTL_SECS / 2) as u64;
/// Offset for not_before to absorb clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

const ROOT_CERT_FILENAME: &str = "root_cert.pem";
const ROOT_KEY_FILENAME: &str = "root_key.pem";

/// Root certificate authority backing the interception proxy.
///
/// The key material persists on disk under `storage_path`; an existing root
/// is reloaded, otherwise a fresh one is generated before any listener
/// starts accepting.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  root_cert_der: CertificateDer<'static>,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the root CA from `storage_path`, generating it when absent.
  pub async fn open(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let cert_path = storage_path.join(ROOT_CERT_FILENAME);
    let key_path = storage_path.join(ROOT_KEY_FILENAME);

    let (issuer, root_cert_der) = if cert_path.exists() && key_path.exists() {
      Self::load_root(&cert_path, &key_path).await?
    } else {
      Self::generate_root(&cert_path, &key_path).await?
    };

    Ok(Self {
      issuer,
      root_cert_der,
      storage_path,
    })
  }

  async fn load_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse root key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to rebuild issuer from root: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in root PEM"))?
      .map_err(|e| Error::certificate(format!("failed to parse root PEM: {}", e)))?;

    Ok((issuer, cert_der))
  }

  async fn generate_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Recast Interception Root CA");
    dn.push(DnType::OrganizationName, "Recast");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    // Root validity: 10 years
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate root key: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign root: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;

    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to build issuer: {}", e)))?;

    tracing::info!("generated new interception root CA at {:?}", cert_path);

    Ok((issuer, cert_der))
  }

  /// Mint a leaf certificate valid for `host`, signed by this root.
  ///
  /// The chain is `[leaf, root]`. Callers are responsible for idempotency;
  /// every invocation produces a fresh certificate and key.
  pub fn sign(&self, host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();

    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // IP targets get an iPAddress SAN plus a dNSName fallback; strict
    // clients check one or the other.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid host name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", host, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok((vec![cert_der, self.root_cert_der.clone()], key_der))
  }

  /// Root certificate in PEM form, for installation into a trust store.
  pub fn ca_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(self.ca_cert_path())
      .map_err(|e| Error::certificate(format!("failed to read root cert: {}", e)))
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(ROOT_CERT_FILENAME)
  }
}

/// Certificate authority plus a cache of minted per-host material.
pub struct CertificateManager {
  ca: CertificateAuthority,
  key_cache: Cache<String, Arc<CertifiedKey>>,
}

impl CertificateManager {
  /// Open the authority under `storage_path` and set up the leaf cache.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::open(storage_path).await?;

    let key_cache = Cache::builder()
      .max_capacity(1000)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();

    Ok(Self { ca, key_cache })
  }

  /// Resolve the rustls signing material for `host`, minting on first use.
  ///
  /// Concurrent first requests for the same host coalesce on the cache so a
  /// host is signed once.
  pub async fn certified_key(&self, host: &str) -> Result<Arc<CertifiedKey>> {
    self
      .key_cache
      .try_get_with(host.to_string(), async {
        let (chain, key_der) = self.ca.sign(host)?;
        let signing_key = any_supported_type(&key_der)
          .map_err(|e| Error::certificate(format!("unusable leaf key for {}: {}", host, e)))?;
        Ok::<_, Error>(Arc::new(CertifiedKey::new(chain, signing_key)))
      })
      .await
      .map_err(|e: Arc<Error>| Error::certificate(e.to_string()))
  }

  /// Mint a root-signed server certificate for the main listener.
  pub fn local_cert(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    self.ca.sign("localhost")
  }

  /// Mint a fresh leaf for `host` without touching the cache.
  pub fn sign(&self, host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    self.ca.sign(host)
  }

  /// Root certificate in PEM form.
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ca.ca_cert_pem()
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}

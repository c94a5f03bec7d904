//! CA and leaf certificate generation using rcgen.

use std::net::IpAddr;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::cache::HostSigner;

/// Default lifetime of signed leaf certificates.
pub const DEFAULT_LEAF_VALIDITY: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to generate certificate: {0}")]
    KeyGeneration(#[from] rcgen::Error),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
    #[error("no hostnames to sign for")]
    NoHosts,
    #[error("leaf validity out of range: {0:?}")]
    InvalidValidity(std::time::Duration),
}

/// Ephemeral CA state for TLS interception.
///
/// Generates a new CA certificate on creation (valid for 24 hours).
/// Used to sign leaf certificates on demand.
pub struct CaState {
    ca_cert_der: CertificateDer<'static>,
    /// PEM form, for handing to clients that must trust the CA.
    ca_cert_pem: String,
    ca_key_pair: KeyPair,
    /// Kept to build the `Issuer` for every leaf.
    ca_params: CertificateParams,
}

impl CaState {
    /// Generates a new ephemeral CA with 24-hour validity.
    pub fn generate() -> CaResult<Self> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "leaf-cert-cache CA");
        dn.push(DnType::OrganizationName, "leaf-cert-cache");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5); // Small buffer for clock skew
        params.not_after = now + Duration::hours(24);

        let key_pair = KeyPair::generate()?;
        let ca_cert = params.self_signed(&key_pair)?;

        debug!("generated ephemeral CA certificate");

        Ok(Self {
            ca_cert_der: CertificateDer::from(ca_cert.der().to_vec()),
            ca_cert_pem: ca_cert.pem(),
            ca_key_pair: key_pair,
            ca_params: params,
        })
    }

    /// Returns the CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Returns the CA certificate in DER format.
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Signs a leaf certificate covering every entry in `hosts`.
    ///
    /// Hosts that parse as IP addresses become IP SANs, the rest DNS SANs.
    /// The first host is used as the subject common name. The returned chain
    /// is `[leaf, ca]`.
    pub fn sign_leaf(
        &self,
        hosts: &[String],
        validity: std::time::Duration,
    ) -> CaResult<CertifiedKey> {
        let Some(common_name) = hosts.first() else {
            return Err(CaError::NoHosts);
        };
        let lifetime =
            Duration::try_from(validity).map_err(|_| CaError::InvalidValidity(validity))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name.as_str());

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = hosts
            .iter()
            .map(|host| subject_alt_name(host))
            .collect::<CaResult<_>>()?;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5);
        params.not_after = now + lifetime;

        let leaf_key_pair = KeyPair::generate()?;
        let issuer = Issuer::from_params(&self.ca_params, &self.ca_key_pair);
        let leaf_cert = params.signed_by(&leaf_key_pair, &issuer)?;

        let cert_der = CertificateDer::from(leaf_cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key_pair.serialize_der()));

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(CaError::SigningKey)?;

        debug!("signed leaf certificate for {}", hosts.join(", "));

        Ok(CertifiedKey::new(
            vec![cert_der, self.ca_cert_der.clone()],
            signing_key,
        ))
    }
}

fn subject_alt_name(host: &str) -> CaResult<SanType> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ok(SanType::DnsName(
        host.try_into()
            .map_err(|_| CaError::InvalidDnsName(host.to_string()))?,
    ))
}

/// [`HostSigner`] that signs leaf certificates with a [`CaState`].
#[derive(Debug, Clone)]
pub struct RcgenSigner {
    validity: std::time::Duration,
}

impl RcgenSigner {
    /// Creates a signer issuing leaves valid for `validity`.
    pub fn new(validity: std::time::Duration) -> Self {
        Self { validity }
    }

    pub fn validity(&self) -> std::time::Duration {
        self.validity
    }
}

impl Default for RcgenSigner {
    fn default() -> Self {
        Self::new(DEFAULT_LEAF_VALIDITY)
    }
}

impl HostSigner for RcgenSigner {
    type Authority = CaState;
    type Certificate = CertifiedKey;
    type Error = CaError;

    fn sign(&self, authority: &CaState, hosts: &[String]) -> CaResult<CertifiedKey> {
        authority.sign_leaf(hosts, self.validity)
    }
}

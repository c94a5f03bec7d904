//! TLS termination with cached, on-demand leaf certificates.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::debug;

use crate::ca::{CaError, CaState, RcgenSigner};
use crate::cache::{CachedSigner, SignHostError};

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
    #[error("client did not send SNI")]
    NoSni,
    #[error("failed to obtain certificate for {host}: {source}")]
    Certificate {
        host: String,
        #[source]
        source: SignHostError<CaError>,
    },
}

/// TLS acceptor that picks the server certificate from the client's SNI.
///
/// The ClientHello is read first, then the certificate is fetched from (or
/// signed into) the shared cache before the handshake continues.
#[derive(Clone)]
pub struct TlsAcceptor {
    signer: Arc<CachedSigner<RcgenSigner>>,
    ca: Arc<CaState>,
}

impl TlsAcceptor {
    /// Creates a new TLS acceptor signing with `ca` through `signer`.
    pub fn new(signer: Arc<CachedSigner<RcgenSigner>>, ca: Arc<CaState>) -> Self {
        Self { signer, ca }
    }

    /// Accepts a TLS connection, performing the handshake.
    /// Returns the TLS stream and the SNI the client asked for.
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, String), AcceptError> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;

        let sni = start
            .client_hello()
            .server_name()
            .map(str::to_owned)
            .ok_or(AcceptError::NoSni)?;
        debug!("resolving certificate for SNI: {}", sni);

        let key = self
            .signer
            .sign_host(&self.ca, std::slice::from_ref(&sni))
            .await
            .map_err(|source| AcceptError::Certificate {
                host: sni.clone(),
                source,
            })?;

        let tls_stream = start.into_stream(Self::create_config(key)).await?;

        debug!("TLS handshake completed, SNI: {}", sni);

        Ok((tls_stream, sni))
    }

    /// Creates a rustls ServerConfig that always presents `key`.
    fn create_config(key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCert(key)));
        Arc::new(config)
    }
}

/// Resolver for a certificate that was chosen before the handshake.
struct FixedCert(Arc<CertifiedKey>);

impl std::fmt::Debug for FixedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedCert").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

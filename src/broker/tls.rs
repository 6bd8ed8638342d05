//! TLS upgrade filter.

use std::sync::Arc;

use async_trait::async_trait;
use http::uri::Scheme;
use http::Uri;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::trace;

use super::{StreamBroker, StreamBrokerFilter};
use crate::error::Error;
use crate::stream::Stream;

/// Certificate verification toggles for the TLS filter.
#[derive(Clone)]
pub struct TlsOptions {
    /// Validate the peer's certificate chain against the bundled
    /// roots.
    pub verify_certificate: bool,
    /// Require the certificate to match the URI host.
    pub verify_host: bool,
    /// Pre-built client config; overrides the toggles when set.
    pub config: Option<Arc<ClientConfig>>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_certificate: true,
            verify_host: true,
            config: None,
        }
    }
}

/// Wraps streams for `https` URIs in a TLS client session; everything
/// else passes through to the parent untouched.
///
/// Handshake and verification failures surface as [`Error::Tls`] and
/// are never retried at this layer.
pub struct TlsStreamBroker {
    parent: Mutex<Arc<dyn StreamBroker>>,
    connector: TlsConnector,
}

impl TlsStreamBroker {
    pub fn new(parent: Arc<dyn StreamBroker>, options: TlsOptions) -> Self {
        let config = options
            .config
            .clone()
            .unwrap_or_else(|| Arc::new(client_config(&options)));
        Self {
            parent: Mutex::new(parent),
            connector: TlsConnector::from(config),
        }
    }
}

fn client_config(options: &TlsOptions) -> ClientConfig {
    if options.verify_certificate && options.verify_host {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::PermissiveVerifier::new(
                options.verify_certificate,
            )))
            .with_no_client_auth()
    }
}

#[async_trait]
impl StreamBroker for TlsStreamBroker {
    async fn get_stream(&self, uri: &Uri) -> Result<Stream, Error> {
        let parent = self.parent.lock().clone();
        let stream = parent.get_stream(uri).await?;
        if uri.scheme() != Some(&Scheme::HTTPS) {
            return Ok(stream);
        }

        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidUri(format!("missing host in {uri}")))?
            .to_owned();
        let domain =
            ServerName::try_from(host).map_err(|err| Error::Tls(Box::new(err)))?;

        let (receive_timeout, send_timeout) = stream.timeouts();
        let io = stream.into_io()?;
        trace!(%uri, "tls handshake");
        let tls = self
            .connector
            .connect(domain, io)
            .await
            .map_err(|err| Error::Tls(Box::new(err)))?;
        Ok(Stream::with_timeouts(
            Box::new(tls),
            receive_timeout,
            send_timeout,
        ))
    }

    fn cancel_pending(&self) {
        self.parent.lock().cancel_pending();
    }
}

impl StreamBrokerFilter for TlsStreamBroker {
    fn parent(&self) -> Arc<dyn StreamBroker> {
        self.parent.lock().clone()
    }

    fn reparent(&self, parent: Arc<dyn StreamBroker>) {
        *self.parent.lock() = parent;
    }
}

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::client::WebPkiServerVerifier;
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};

    /// Verifier backing the relaxed toggles: chain validation against
    /// the bundled roots with hostname mismatches forgiven, or no
    /// chain validation at all. Handshake signatures are always
    /// checked.
    #[derive(Debug)]
    pub(super) struct PermissiveVerifier {
        chain: Option<Arc<WebPkiServerVerifier>>,
    }

    impl PermissiveVerifier {
        pub(super) fn new(verify_certificate: bool) -> Self {
            let chain = verify_certificate.then(|| {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                WebPkiServerVerifier::builder(Arc::new(roots))
                    .build()
                    .expect("bundled roots are non-empty")
            });
            Self { chain }
        }
    }

    impl ServerCertVerifier for PermissiveVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            match &self.chain {
                None => Ok(ServerCertVerified::assertion()),
                Some(verifier) => match verifier.verify_server_cert(
                    end_entity,
                    intermediates,
                    server_name,
                    ocsp_response,
                    now,
                ) {
                    Err(rustls::Error::InvalidCertificate(
                        CertificateError::NotValidForName
                        | CertificateError::NotValidForNameContext { .. },
                    )) => Ok(ServerCertVerified::assertion()),
                    other => other,
                },
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &provider().signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &provider().signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    fn provider() -> Arc<CryptoProvider> {
        CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
    }
}

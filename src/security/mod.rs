//! Node identity and the TLS configuration derived from it.
//!
//! Every node presents a self-signed certificate for its identity key, in both directions. A
//! peer certificate is accepted when the handshake signature verifies against it, which proves
//! the peer holds the key; mapping that key to a peer id is left to the caller, who can read the
//! certificate off the connection.

use std::sync::Arc;

use rcgen::{CertificateParams, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};

use crate::error::Result;

pub const ALPN: &[u8] = b"rustp2p-quic";
pub(crate) const SERVER_NAME: &str = "rustp2p";

pub struct Identity {
    key_pair: KeyPair,
}

impl Identity {
    pub fn generate() -> Result<Identity> {
        Ok(Self {
            key_pair: KeyPair::generate()?,
        })
    }
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Identity> {
        Ok(Self {
            key_pair: KeyPair::try_from(der)?,
        })
    }
    pub fn to_pkcs8_der(&self) -> Vec<u8> {
        self.key_pair.serialize_der()
    }
    pub fn public_key_der(&self) -> Vec<u8> {
        self.key_pair.public_key_der()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").finish_non_exhaustive()
    }
}

/// TLS material for one transport, built once from its identity.
#[derive(Debug)]
pub struct SecurityConfig {
    certificate: CertificateDer<'static>,
    server: Arc<rustls::ServerConfig>,
    client: Arc<rustls::ClientConfig>,
}

impl SecurityConfig {
    pub fn new(identity: &Identity) -> Result<SecurityConfig> {
        let params = CertificateParams::new(vec![SERVER_NAME.to_string()])?;
        let certificate = params.self_signed(&identity.key_pair)?.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.to_pkcs8_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(PeerCertVerifier {
            algorithms: provider.signature_verification_algorithms,
        });

        let mut server = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier.clone())
            .with_single_cert(vec![certificate.clone()], key.clone_key())?;
        server.alpn_protocols = vec![ALPN.to_vec()];

        let mut client = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(vec![certificate.clone()], key)?;
        client.alpn_protocols = vec![ALPN.to_vec()];

        Ok(Self {
            certificate,
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }
    pub fn server_tls(&self) -> Arc<rustls::ServerConfig> {
        self.server.clone()
    }
    pub fn client_tls(&self) -> Arc<rustls::ClientConfig> {
        self.client.clone()
    }
}

#[derive(Debug)]
struct PeerCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for PeerCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

//! Mutual TLS 1.3 setup per `spec.md` §6: trust exactly the peer's
//! configured root CA, disable hostname checking (STOMP peers aren't
//! addressed by DNS name), and instead verify the certificate the other
//! side presents by matching its subject common name against the
//! `node_id` this relay was configured to expect.
//!
//! Grounded on `tokio-rustls`'s custom-verifier pattern (the same shape
//! rustls's own example clients use to swap out certificate
//! verification) and on the `x509-parser` usage in the pack's
//! `redbco-redb-open`/`ParkWardRR-PacketParamedic` manifests for
//! reading the subject out of a DER certificate — no retrieved source
//! file exercises a custom verifier directly, so this module has no
//! single grounding file; it follows the documented rustls 0.23 API.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{verify_server_cert_signed_by_trust_anchor, ParsedCertificate};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, Error as TlsError, RootCertStore, SignatureScheme};

use crate::directory::{NodeInfo, PeerInfo};
use crate::error::ServerError;

/// The node's own server identity: a leaf certificate (PEM) and its
/// private key, issued outside this crate's directory tree.
#[derive(Clone)]
pub struct NodeIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

fn root_store_from_pem(pem: &[u8]) -> Result<RootCertStore, ServerError> {
    let mut store = RootCertStore::empty();
    let mut reader = std::io::Cursor::new(pem);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|_| ServerError::simple("malformed root CA PEM"))?;
        store
            .add(cert)
            .map_err(|_| ServerError::simple("root CA certificate rejected"))?;
    }
    if store.is_empty() {
        return Err(ServerError::simple("root CA PEM contained no certificates"));
    }
    Ok(store)
}

fn cert_chain_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = std::io::Cursor::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ServerError::simple("malformed certificate PEM"))
}

fn private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| ServerError::simple("malformed private key PEM"))?
        .ok_or_else(|| ServerError::simple("no private key found in PEM"))
}

/// Extract the certificate subject's common name, the field `spec.md`
/// §6 uses to carry the peer's `node_id`.
fn subject_common_name(cert: &CertificateDer<'_>) -> Result<String, ServerError> {
    let (_, parsed) =
        x509_parser::parse_x509_certificate(cert.as_ref()).map_err(|_| ServerError::simple("unparsable peer certificate"))?;
    parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| ServerError::simple("peer certificate has no subject common name"))
}

fn check_node_id(cert: &CertificateDer<'_>, expected: &str) -> Result<(), TlsError> {
    let cn = subject_common_name(cert).map_err(|_| TlsError::General("unparsable peer certificate".into()))?;
    if cn != expected {
        return Err(TlsError::General(format!(
            "certificate subject {cn:?} does not match configured node_id {expected:?}"
        )));
    }
    Ok(())
}

/// Verifies the server's certificate chain against a single pinned
/// root CA, then checks the leaf's subject against `expected_node_id`
/// instead of the (disabled) hostname.
#[derive(Debug)]
struct PinnedServerVerifier {
    roots: RootCertStore,
    expected_node_id: String,
    provider: CryptoProvider,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        check_node_id(end_entity, &self.expected_node_id)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Symmetric to `PinnedServerVerifier`, for authenticating the client
/// half of a mutual handshake on an accepted (server-role) connection.
#[derive(Debug)]
struct PinnedClientVerifier {
    roots: RootCertStore,
    subjects: Vec<DistinguishedName>,
    expected_node_id: String,
    provider: CryptoProvider,
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.subjects
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        check_node_id(end_entity, &self.expected_node_id)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Build the `rustls::ClientConfig` used to dial out to `peer`: trusts
/// exactly `peer.root_cert`, presents `identity`'s certificate chain
/// concatenated with `peer.sub_cert` (the intermediate the peer issued
/// so our leaf chains up to a root they also trust).
pub fn client_config(peer: &PeerInfo, identity: &NodeIdentity) -> Result<Arc<rustls::ClientConfig>, ServerError> {
    let roots = root_store_from_pem(&peer.root_cert)?;
    let provider = rustls::crypto::ring::default_provider();

    let verifier = Arc::new(PinnedServerVerifier {
        roots,
        expected_node_id: peer.node_id.clone(),
        provider: provider.clone(),
    });

    let mut chain = cert_chain_from_pem(&identity.cert_pem)?;
    if let Some(sub_cert) = &peer.sub_cert {
        chain.extend(cert_chain_from_pem(sub_cert)?);
    }
    let key = private_key_from_pem(&identity.key_pem)?;

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|_| ServerError::simple("unsupported TLS protocol version set"))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(chain, key)
        .map_err(|_| ServerError::simple("invalid client certificate/key pair"))?;

    Ok(Arc::new(config))
}

/// Build the `rustls::ServerConfig` used to accept a connection from
/// `peer`: presents `identity`'s chain (again concatenated with
/// `peer.sub_cert`), and requires + verifies the peer's client
/// certificate against `peer.root_cert`.
pub fn server_config(
    _node: &NodeInfo,
    peer: &PeerInfo,
    identity: &NodeIdentity,
) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let roots = root_store_from_pem(&peer.root_cert)?;
    let provider = rustls::crypto::ring::default_provider();
    let subjects = roots.subjects();

    let verifier = Arc::new(PinnedClientVerifier {
        roots,
        subjects,
        expected_node_id: peer.node_id.clone(),
        provider: provider.clone(),
    });

    let mut chain = cert_chain_from_pem(&identity.cert_pem)?;
    if let Some(sub_cert) = &peer.sub_cert {
        chain.extend(cert_chain_from_pem(sub_cert)?);
    }
    let key = private_key_from_pem(&identity.key_pem)?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|_| ServerError::simple("unsupported TLS protocol version set"))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|_| ServerError::simple("invalid server certificate/key pair"))?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_store_rejects_garbage_pem() {
        assert!(root_store_from_pem(b"not a certificate").is_err());
    }

    #[test]
    fn cert_chain_rejects_garbage_pem() {
        assert!(cert_chain_from_pem(b"not a certificate").is_err());
    }
}

//! Ephemeral cryptographic identity (C2): RSA keypair, self-signed X.509
//! certificate, SHA-256(DER) fingerprint, and the fingerprint-pinned TLS
//! client verification policy.
//!
//! Adapted from the fingerprint-pinning idiom used for master/rcpd TLS
//! elsewhere in the workspace, but generating RSA (not Ed25519) keys and
//! comparing fingerprints in constant time.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PrivatePkcs8KeyDer};
use rsa::pkcs8::EncodePrivateKey;
use rsa::rand_core::OsRng;
use rsa::RsaPrivateKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// SHA-256 of a DER-encoded certificate.
pub type Fingerprint = [u8; 32];

const COMMON_NAME: &str = "LocalSend CLI";
const RSA_KEY_BITS: usize = 2048;

/// A session-scoped identity: never persisted, destroyed when the process
/// that created it exits.
#[derive(Clone)]
pub struct Identity {
    pub cert_der: Vec<u8>,
    pub cert_pem: String,
    pub key_der: Vec<u8>,
    pub key_pem: String,
    pub fingerprint: Fingerprint,
}

impl Identity {
    /// Generates a fresh RSA-2048 key, a self-signed certificate valid for
    /// at most one day, and computes its fingerprint.
    #[tracing::instrument]
    pub fn generate() -> Result<Self> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| Error::Tls(format!("failed to generate RSA key: {e}")))?;
        let key_der_bytes = private_key
            .to_pkcs8_der()
            .map_err(|e| Error::Tls(format!("failed to encode private key: {e}")))?
            .as_bytes()
            .to_vec();

        let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(key_der_bytes.clone()),
            &rcgen::PKCS_RSA_SHA256,
        )
        .map_err(|e| Error::Tls(format!("failed to load RSA key into certificate builder: {e}")))?;

        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, COMMON_NAME);
        params.distinguished_name = name;
        let not_before = rcgen::time::OffsetDateTime::now_utc() - rcgen::time::Duration::minutes(5);
        let not_after = rcgen::time::OffsetDateTime::now_utc() + rcgen::time::Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Tls(format!("failed to self-sign certificate: {e}")))?;

        let cert_der = cert.der().to_vec();
        let fingerprint = compute_fingerprint(&cert_der);

        Ok(Self {
            cert_pem: cert.pem(),
            cert_der,
            key_pem: key_pair.serialize_pem(),
            key_der: key_der_bytes,
            fingerprint,
        })
    }

    pub fn fingerprint_hex(&self) -> String {
        fingerprint_to_hex(&self.fingerprint)
    }
}

pub fn compute_fingerprint(cert_der: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hasher.finalize().into()
}

pub fn fingerprint_to_hex(fingerprint: &Fingerprint) -> String {
    hex::encode(fingerprint)
}

pub fn fingerprint_from_hex(s: &str) -> Result<Fingerprint> {
    let bytes = hex::decode(s).map_err(|e| Error::Tls(format!("invalid fingerprint hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(Error::Tls(format!(
            "fingerprint must be 32 bytes (64 hex chars), got {}",
            bytes.len()
        )));
    }
    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&bytes);
    Ok(fingerprint)
}

fn fingerprints_equal(a: &Fingerprint, b: &Fingerprint) -> bool {
    a.ct_eq(b).into()
}

/// Builds a client TLS config that accepts a server certificate if and only
/// if its SHA-256(DER) equals `expected_fingerprint`; fingerprints are
/// compared in constant time.
pub fn client_config(expected_fingerprint: Fingerprint) -> ClientConfig {
    let verifier = std::sync::Arc::new(FingerprintServerCertVerifier {
        expected_fingerprint,
    });
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth()
}

/// Trust-on-fingerprint server certificate verifier: the certificate chain
/// and signature are never validated, only the DER fingerprint.
#[derive(Debug)]
struct FingerprintServerCertVerifier {
    expected_fingerprint: Fingerprint,
}

impl ServerCertVerifier for FingerprintServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let actual = compute_fingerprint(end_entity.as_ref());
        if fingerprints_equal(&actual, &self.expected_fingerprint) {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(
                expected = %fingerprint_to_hex(&self.expected_fingerprint),
                actual = %fingerprint_to_hex(&actual),
                "TLS server certificate fingerprint mismatch"
            );
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadSignature,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        // trust is fingerprint-based, not chain/signature-based
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

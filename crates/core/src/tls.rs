//! Client-side TLS for the WHIP forwarder: either the system trust roots or
//! a SHA-256 certificate fingerprint pin, built as a `rustls::ClientConfig`.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};

/// Verifier that accepts exactly one certificate: the one whose SHA-256
/// fingerprint matches the configured pin. Used instead of (not alongside)
/// the system trust roots when a fingerprint is configured.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Vec<u8>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() == self.expected.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("certificate fingerprint mismatch".to_string()))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
        ]
    }
}

fn parse_fingerprint(fingerprint: &str) -> Result<Vec<u8>> {
    let cleaned: String = fingerprint.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    let mut bytes = Vec::with_capacity(cleaned.len() / 2);
    let digits: Vec<char> = cleaned.chars().collect();
    for pair in digits.chunks(2) {
        if pair.len() != 2 {
            anyhow::bail!("fingerprint has an odd number of hex digits");
        }
        let byte = u8::from_str_radix(&pair.iter().collect::<String>(), 16).context("invalid fingerprint hex")?;
        bytes.push(byte);
    }
    Ok(bytes)
}

fn client_config(fingerprint: Option<&str>) -> Result<ClientConfig> {
    match fingerprint {
        Some(fp) => {
            let expected = parse_fingerprint(fp)?;
            let verifier = Arc::new(FingerprintVerifier { expected });
            Ok(ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth())
        }
        None => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Ok(ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth())
        }
    }
}

/// Build the `reqwest::Client` used for WHIP offer/answer and trickle ICE,
/// pinned to `fingerprint` when given.
pub fn build_http_client(fingerprint: Option<&str>) -> Result<reqwest::Client> {
    let config = client_config(fingerprint)?;
    reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .build()
        .context("building WHIP HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_separated_fingerprint() {
        let bytes = parse_fingerprint("AA:BB:CC:DD").unwrap();
        assert_eq!(bytes, vec![0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn rejects_odd_length_fingerprint() {
        assert!(parse_fingerprint("ABC").is_err());
    }
}

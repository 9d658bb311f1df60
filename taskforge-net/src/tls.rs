/// TLS configuration for sessions.
///
/// Server mode loads a cert/key pair and rejects pre-TLS1.2 protocol
/// versions by construction (`rustls` never negotiates SSLv2/SSLv3).
/// Client mode trusts only the configured CA file — no system default
/// roots, no `webpki-roots`/`rustls-native-certs` fallback — unless
/// `ssl_insecure_skip_verify` is set, in which case peer verification is
/// disabled entirely via a custom verifier (dev only, logged loudly
/// every time one is built). A client with neither a CA file nor
/// insecure mode configured has no trust source at all and fails to
/// build rather than silently trusting the platform's roots.
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use taskforge_shared::config::SessionConfig;

use crate::error::SessionError;

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, SessionError> {
    let file = File::open(path).map_err(SessionError::Io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(SessionError::Io)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, SessionError> {
    let file = File::open(path).map_err(SessionError::Io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(SessionError::Io)?
        .ok_or_else(|| SessionError::Tls(format!("no private key found in {path}")))
}

/// Disables peer verification entirely. Only constructed when
/// `ssl_insecure_skip_verify` is explicitly set; logs a warning on every
/// construction so it can't go unnoticed in a log stream.
#[derive(Debug)]
struct InsecureVerifier {
    supported_schemes: Vec<SignatureScheme>,
}

impl InsecureVerifier {
    fn new() -> Self {
        tracing::warn!("TLS peer verification disabled (ssl_insecure_skip_verify) -- dev use only");
        InsecureVerifier {
            supported_schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for InsecureVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_schemes.clone()
    }
}

/// Builds a client `rustls::ClientConfig` from session configuration.
///
/// Trusts only `ssl_ca_file` when set — no system default roots, no
/// `webpki-roots`/`rustls-native-certs` fallback. When no CA file is
/// configured and insecure mode is off, there is no trust source to
/// build a config from, so this returns `SessionError::Tls` rather than
/// silently trusting the platform's roots.
pub fn build_client_config(config: &SessionConfig) -> Result<ClientConfig, SessionError> {
    let builder = ClientConfig::builder();

    if config.ssl_insecure_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
            .with_no_client_auth());
    }

    let ca_file = config
        .ssl_ca_file
        .as_ref()
        .ok_or_else(|| SessionError::Tls("no ssl_ca_file configured and ssl_insecure_skip_verify is false: no trust source".into()))?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots
            .add(cert)
            .map_err(|e| SessionError::Tls(format!("invalid CA cert in {ca_file}: {e}")))?;
    }

    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Builds a server `rustls::ServerConfig` from session configuration.
pub fn build_server_config(config: &SessionConfig) -> Result<ServerConfig, SessionError> {
    let cert_file = config
        .ssl_cert_file
        .as_ref()
        .ok_or_else(|| SessionError::Tls("enable_ssl set but ssl_cert_file is missing".into()))?;
    let key_file = config
        .ssl_key_file
        .as_ref()
        .ok_or_else(|| SessionError::Tls("enable_ssl set but ssl_key_file is missing".into()))?;

    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SessionError::Tls(format!("invalid cert/key pair: {e}")))
}

/// Resolves the SNI / hostname-verification target: the explicit
/// `tls_server_name` if set, else the literal connect host.
pub fn server_name_for(config: &SessionConfig, connect_host: &str) -> Result<ServerName<'static>, SessionError> {
    let name = config
        .tls_server_name
        .clone()
        .unwrap_or_else(|| connect_host.to_string());
    ServerName::try_from(name.clone())
        .map(|n| n.to_owned())
        .map_err(|_| SessionError::Tls(format!("invalid server name: {name}")))
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Could not read {note} file {filename:?}: {err}")]
    FileReadFailed {
        note: &'static str,
        filename: PathBuf,
        err: io::Error,
    },
    #[error("Identity certificate is missing a key")]
    MissingKey,
    #[error("Certificate file contains no certificates")]
    MissingCertificate,
    #[error("Could not parse certificate in {filename:?}: {err}")]
    CertificateParse { filename: PathBuf, err: io::Error },
    #[error("Could not parse private key in {filename:?}: {err}")]
    PrivateKeyParse { filename: PathBuf, err: io::Error },
    #[error("Error building TLS config: {0}")]
    TlsBuild(rustls::Error),
    #[error("Error adding a certificate to a store: {0}")]
    AddCertToStore(rustls::Error),
    #[error("{0}")]
    VerifierBuild(rustls::client::VerifierBuilderError),
}

const fn default_true() -> bool {
    true
}

/// Configures the TLS options for connections to the Consul agent.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Path to a CA certificate file in PEM format. When set, its
    /// certificates replace the system roots, which are used otherwise.
    pub ca: Option<PathBuf>,

    /// Path to a PEM certificate used to identify this client. If this is set
    /// "key" must also be set.
    pub cert: Option<PathBuf>,

    /// Path to a PEM private key (PKCS#8) used to identify this client.
    pub key: Option<PathBuf>,

    /// Enables certificate verification.
    ///
    /// Do NOT set this to false unless you understand the risks of not verifying
    /// the validity of certificates.
    #[serde(default = "default_true")]
    pub verify_certificate: bool,

    /// Enables hostname verification.
    #[serde(default = "default_true")]
    pub verify_hostname: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca: None,
            cert: None,
            key: None,
            verify_certificate: true,
            verify_hostname: true,
        }
    }
}

impl TlsConfig {
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let algorithms = provider.signature_verification_algorithms;

        let mut root_store = RootCertStore::empty();
        match &self.ca {
            Some(ca_file) => {
                for cert in load_certs(ca_file)? {
                    root_store.add(cert).map_err(TlsError::AddCertToStore)?;
                }
            }
            None => {
                let result = rustls_native_certs::load_native_certs();
                if !result.errors.is_empty() {
                    warn!(
                        message = "native root CA certificate loading errors",
                        errs = ?result.errors
                    );
                }

                let (added, ignored) = root_store.add_parsable_certificates(result.certs);
                debug!(message = "native root CA certificates loaded", added, ignored);
            }
        }

        // Without any root, plain http still works, while every https handshake
        // will be rejected by the verifier below.
        let roots = if root_store.is_empty() {
            None
        } else {
            let verifier = WebPkiServerVerifier::builder_with_provider(
                Arc::new(root_store.clone()),
                Arc::clone(&provider),
            )
            .build()
            .map_err(TlsError::VerifierBuild)?;
            Some(verifier)
        };

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(TlsError::TlsBuild)?
            .with_root_certificates(root_store);
        let mut config = match (&self.cert, &self.key) {
            (Some(cert_file), Some(key_file)) => {
                let certs = load_certs(cert_file)?;
                let key = load_private_key(key_file)?;

                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(TlsError::TlsBuild)?
            }
            (Some(_), None) => return Err(TlsError::MissingKey),
            (None, Some(_)) => return Err(TlsError::MissingCertificate),
            (None, None) => builder.with_no_client_auth(),
        };

        config
            .dangerous()
            .set_certificate_verifier(Arc::new(ServerCertVerifier {
                roots,
                algorithms,
                verify_certificate: self.verify_certificate,
                verify_hostname: self.verify_hostname,
            }));

        Ok(config)
    }
}

#[derive(Debug)]
struct ServerCertVerifier {
    roots: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,

    verify_certificate: bool,
    verify_hostname: bool,
}

impl rustls::client::danger::ServerCertVerifier for ServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        if !self.verify_certificate {
            return Ok(ServerCertVerified::assertion());
        }

        let Some(roots) = &self.roots else {
            return Err(Error::InvalidCertificate(CertificateError::UnknownIssuer));
        };

        match roots.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            err @ Err(Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                if self.verify_hostname {
                    err
                } else {
                    Ok(ServerCertVerified::assertion())
                }
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        if self.verify_certificate {
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
        } else {
            Ok(HandshakeSignatureValid::assertion())
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        if self.verify_certificate {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
        } else {
            Ok(HandshakeSignatureValid::assertion())
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn load_certs(filename: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let content = fs::read(filename).map_err(|err| TlsError::FileReadFailed {
        note: "certificate",
        filename: filename.to_path_buf(),
        err,
    })?;

    let certs = pem::parse_many(content)
        .map_err(|err| TlsError::CertificateParse {
            filename: filename.to_path_buf(),
            err: io::Error::new(io::ErrorKind::InvalidData, err),
        })?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect::<Vec<_>>();

    if certs.is_empty() {
        return Err(TlsError::MissingCertificate);
    }

    Ok(certs)
}

fn load_private_key(filename: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let content = fs::read(filename).map_err(|err| TlsError::FileReadFailed {
        note: "private key",
        filename: filename.to_path_buf(),
        err,
    })?;

    let key = pem::parse_many(content)
        .map_err(|err| TlsError::PrivateKeyParse {
            filename: filename.to_path_buf(),
            err: io::Error::new(io::ErrorKind::InvalidData, err),
        })?
        .into_iter()
        .find(|p| matches!(p.tag(), "PRIVATE KEY" | "RSA PRIVATE KEY" | "EC PRIVATE KEY"))
        .ok_or_else(|| TlsError::PrivateKeyParse {
            filename: filename.to_path_buf(),
            err: io::Error::new(
                io::ErrorKind::InvalidData,
                "no private key found in PEM file",
            ),
        })?;

    let der = match key.tag() {
        "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(key.into_contents().into()),
        "EC PRIVATE KEY" => PrivateKeyDer::Sec1(key.into_contents().into()),
        _ => PrivateKeyDer::Pkcs8(key.into_contents().into()),
    };

    Ok(der)
}

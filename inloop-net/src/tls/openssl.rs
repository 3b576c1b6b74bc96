use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;

use super::types::{LeafCertificate, TlsError, TlsErrorKind};

pub fn build_acceptor(leaf: &LeafCertificate) -> Result<SslAcceptor, TlsError> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    let cert = X509::from_pem(&leaf.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    let key = PKey::private_key_from_pem(&leaf.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    builder
        .set_certificate(&cert)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    builder
        .set_private_key(&key)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    builder.set_verify(SslVerifyMode::NONE);

    Ok(builder.build())
}

// Connector for the proxy's own outbound dials. Certificate verification is
// off: the process is intercepting its own traffic, and upstream connections
// may themselves pass back through interception layers with minted certs.
pub fn build_insecure_connector() -> Result<SslConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    builder.set_verify(SslVerifyMode::NONE);
    Ok(builder.build())
}

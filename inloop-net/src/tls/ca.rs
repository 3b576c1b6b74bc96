use std::fs;
use std::path::Path;

use chrono::{Datelike, Duration, Utc};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

use super::types::{CaCertificate, CaMaterial, TlsError, TlsErrorKind};

const CA_CERT_FILE: &str = "inloop-ca.pem";
const CA_KEY_FILE: &str = "inloop-ca-key.pem";
const CA_VALIDITY_DAYS: i64 = 365;

// Loads the interception CA from `dir` when present, so leaf certificates
// stay verifiable across restarts in the same working directory, and
// otherwise mints a fresh one and persists it there.
pub fn load_or_generate_ca(
    dir: impl AsRef<Path>,
    common_name: &str,
) -> Result<CaCertificate, TlsError> {
    let dir = dir.as_ref();
    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        let cert_pem = fs::read_to_string(&cert_path)
            .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
        let key_pem = fs::read_to_string(&key_path)
            .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem, key)
            .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;
        let cert = Certificate::from_params(params)
            .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;

        return Ok(CaCertificate {
            material: CaMaterial {
                cert_pem: cert_pem.into_bytes(),
                key_pem: key_pem.into_bytes(),
            },
            cert,
        });
    }

    let ca = generate_ca(common_name)?;

    fs::create_dir_all(dir).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    fs::write(&cert_path, &ca.material.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    fs::write(&key_path, &ca.material.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    Ok(ca)
}

fn generate_ca(common_name: &str) -> Result<CaCertificate, TlsError> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Inloop");
    params.distinguished_name = dn;

    let issued = Utc::now();
    let expires = issued + Duration::days(CA_VALIDITY_DAYS);
    params.not_before =
        rcgen::date_time_ymd(issued.year(), issued.month() as u8, issued.day() as u8);
    params.not_after =
        rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);

    let cert = Certificate::from_params(params)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;

    let cert_pem = cert
        .serialize_pem()
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?
        .into_bytes();
    let key_pem = cert.serialize_private_key_pem().into_bytes();

    Ok(CaCertificate {
        material: CaMaterial { cert_pem, key_pem },
        cert,
    })
}

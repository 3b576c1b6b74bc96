#[derive(Debug)]
pub struct CaMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

pub struct CaCertificate {
    pub material: CaMaterial,
    pub cert: rcgen::Certificate,
}

#[derive(Debug, Clone)]
pub struct LeafCertificate {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Debug)]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

#[derive(Debug)]
pub enum TlsErrorKind {
    Rcgen,
    Io,
    OpenSsl,
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

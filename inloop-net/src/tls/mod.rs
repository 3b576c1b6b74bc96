mod ca;
mod cache;
mod cert;
mod openssl;
mod types;

pub use ca::load_or_generate_ca;
pub use cache::LeafCache;
pub use cert::generate_leaf_cert;
pub use openssl::{build_acceptor, build_insecure_connector};
pub use types::{CaCertificate, CaMaterial, LeafCertificate, TlsError, TlsErrorKind};

mod http1;
mod tls;

pub use http1::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseStatus, Request, RequestLine,
    RequestParser, Response, ResponseParser, StatusLine,
};

pub use tls::{
    CaCertificate, CaMaterial, LeafCache, LeafCertificate, TlsError, TlsErrorKind, build_acceptor,
    build_insecure_connector, generate_leaf_cert, load_or_generate_ca,
};

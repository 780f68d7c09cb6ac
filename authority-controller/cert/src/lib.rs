#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cert;
pub mod jwt;
mod sign;
mod storage;
pub mod tls;

pub use self::{
    cert::{decode_cert, spiffe_id_from_der, Cert},
    sign::{generate_authority_cert, generate_csr, sign_from_csr, sign_server_cert, Csr},
    storage::{refresh_interval, CertStorage, Config},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to generate key pair: {0}")]
    Key(#[source] rcgen::Error),

    #[error("failed to sign certificate: {0}")]
    Sign(#[source] rcgen::Error),

    #[error("invalid certificate signing request: {0}")]
    InvalidCsr(#[source] rcgen::Error),

    #[error("invalid name {name:?}: {source}")]
    InvalidName {
        name: String,
        #[source]
        source: rcgen::Error,
    },

    #[error("no valid authority certificate")]
    NoAuthority,

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("failed to sign token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

pub mod acme;
pub mod cache;
pub mod cert;
pub mod config;
pub mod crypto;
pub mod csr;
pub mod daemon;
pub mod dns;
pub mod error;
pub mod issuer;
pub mod renew;
pub mod state;

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

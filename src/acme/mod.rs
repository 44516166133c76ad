//! RFC 8555 client primitives.
//!
//! Directory, nonce and account handling, orders, authorizations and challenges as plain async calls. Every signed
//! request carries a freshly fetched nonce. Deciding what to do with the results (which challenge to solve, when to
//! give up, what to clean up) is left to [`crate::issuer`].

pub mod client;
pub mod error;
pub mod http;
pub mod object;

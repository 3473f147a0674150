//! Key derivation and token issuance/verification for the request
//! authentication pipeline (spec.md §4.1, §4.2).

mod kdf;
mod token;

pub use kdf::{cookie_block_key, cookie_hash_key, derive, router_mac, token_signing_key, KdfError};
pub use token::{
    inspect, issue_client_token, issue_dev_token, issue_session_token, verify, Claims,
};

//! Bearer token acquisition for control-plane calls.

mod token;

pub use token::{TokenRetriever, TOKEN_ENDPOINT};

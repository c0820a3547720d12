//! Token and signature utilities for agents and webhooks.

mod token;

pub use token::{constant_time_eq, generate_token, hash_token};

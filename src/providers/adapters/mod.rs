//! Concrete adapters for the three integration shapes: cursor-native
//! aggregators (e.g. Plaid-style), OAuth-redirect aggregators with
//! per-account pagination (e.g. Tink/GoCardless-style), and direct-bank
//! APIs authenticated with client-supplied credentials.

pub mod cursor_aggregator;
pub mod direct_bank;
pub mod oauth_redirect_aggregator;

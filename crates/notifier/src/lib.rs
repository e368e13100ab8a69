//! Outbound HTTP for the dispatch pipeline.
//!
//! - [`provider`]: the external notification provider the delivery worker calls
//! - [`callback`]: the caller-supplied completion callback
//! - [`cache`]: credential-keyed cache of provider clients

pub mod cache;
pub mod callback;
pub mod provider;

//! Integrations that rely on third-party services.
//!
//! Currently this is the captcha solving services, which are reached through
//! the crate's own fetch client.

pub mod captcha;

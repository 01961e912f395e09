//! On-disk caches shared across processes of the same identity.
//!
//! Both caches are keyed by connection name and live under the namespace
//! root chosen by [`crate::config::RuntimeConfig`].

pub mod browser;
pub mod session;

pub use browser::{BrowserProfileCache, ProfileDir};
pub use session::{CachedSession, SessionCache};

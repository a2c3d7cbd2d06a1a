//! fluxgate: a multi-protocol API gateway.
//!
//! The data plane accepts HTTP/HTTPS, raw TCP, and gRPC traffic, matches it
//! to a configured service, enforces access and rate-limit policy, and
//! forwards to an upstream selected by the service's load-balancing policy.
//! Configuration is loaded once at startup as an immutable snapshot; the
//! control plane lives behind the [`store::ConfigStore`] boundary.

pub mod app;
pub mod auth;
pub mod config;
pub mod flow;
pub mod http;
pub mod lb;
pub mod proxy;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod tests_common;

pub use config::Config;

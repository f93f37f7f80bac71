//! HTTP route modules, grouped by surface.

pub mod agents;
pub mod auth;
pub mod metrics;
pub mod rag;
pub mod webhooks;

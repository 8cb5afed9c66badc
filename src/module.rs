//! Pluggable route sets.
//!
//! A module owns whatever state its handlers need (a catalog, a per-endpoint
//! rate limiter) and clones `Arc` handles of it into each route closure.
//!
//! # Example
//!
//! ```ignore
//! use homestead::{Module, Router};
//!
//! pub struct Health;
//!
//! impl Module for Health {
//!     fn name(&self) -> &'static str {
//!         "health"
//!     }
//!
//!     fn routes(&self, router: &mut Router) {
//!         router.get("/health", |_ctx| async move {
//!             homestead::response::ok(&homestead::json!({ "status": "ok" }))
//!         });
//!     }
//! }
//! ```

use tracing::info;

use crate::router::Router;

/// A set of routes sharing state.
pub trait Module: Send + Sync {
    /// Module name for identification and logging.
    fn name(&self) -> &'static str;

    /// Register this module's routes.
    fn routes(&self, router: &mut Router);
}

/// Register the routes of every module in order.
pub fn mount(router: &mut Router, modules: &[&dyn Module]) {
    for module in modules {
        info!(module = module.name(), "mounting routes");
        module.routes(router);
    }
}

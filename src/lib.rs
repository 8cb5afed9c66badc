//! Homestead - request admission control and inventory expansion for the
//! homestead productivity backend.
//!
//! - **Rate limit**: Token-bucket limiter keyed by client identity
//! - **Inventory**: Expansion of bundle order lines into simple-product quantities
//! - **Config**: Layered configuration (file → env → CLI)
//! - **Router**: HTTP routing with path parameters
//! - **Server**: Hyper-based HTTP server with per-IP admission control
//! - **Orders**: Order requirement and catalog endpoints
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use homestead::inventory::{Catalog, Component};
//! use homestead::{Loader, OrdersModule, RateLimiter, Router};
//!
//! #[tokio::main]
//! async fn main() -> homestead::Result<()> {
//!     let config = Loader::new("HOMESTEAD").load(None, None, None)?;
//!
//!     let catalog = Catalog::new()
//!         .simple("mug")
//!         .simple("coaster")
//!         .bundle("gift-set", vec![Component::new("mug", 2), Component::new("coaster", 4)]);
//!
//!     // One limiter per endpoint, built once at startup.
//!     let orders_limiter = Arc::new(RateLimiter::new(10.0, 0.5)?);
//!     let orders = OrdersModule::new(catalog, orders_limiter)?;
//!
//!     let mut router = Router::new();
//!     homestead::module::mount(&mut router, &[&orders]);
//!
//!     homestead::server::run(config, router.into_handle()).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod inventory;
pub mod module;
pub mod orders;
pub mod rate_limit;
pub mod response;
pub mod router;
pub mod server;

// Re-export main types at crate root
pub use config::{Config, Loader};
pub use error::{Error, Result};
pub use inventory::{Catalog, LineItem, ProductKind, required_quantities};
pub use module::Module;
pub use orders::OrdersModule;
pub use rate_limit::{Decision, RateLimiter};
pub use router::{Context, Router};

// Re-export commonly used dependencies for convenience
pub use hyper::Method;
pub use serde_json::json;

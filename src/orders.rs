//! Order and catalog endpoints.
//!
//! - `POST /api/orders/requirements` expands an order's lines into simple
//!   product quantities. Rate limited per client before any work is done.
//! - `GET /api/catalog/{id}` describes one product.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::inventory::{self, Catalog, Component, LineItem, ProductKind, Requirements};
use crate::module::Module;
use crate::rate_limit::RateLimiter;
use crate::router::Router;
use crate::{Error, Result, response};

/// Tokens charged per requirements request.
const REQUIREMENTS_COST: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct RequirementsRequest {
    items: Vec<LineItem>,
    /// Reject unknown product ids instead of skipping them.
    #[serde(default)]
    strict: bool,
}

#[derive(Debug, Serialize)]
struct RequirementsResponse {
    requirements: Requirements,
}

#[derive(Debug, Serialize)]
struct ProductView<'a> {
    id: &'a str,
    kind: ProductKind,
    components: &'a [Component],
}

/// Routes over a fixed product catalog.
pub struct OrdersModule {
    catalog: Arc<Catalog>,
    limiter: Arc<RateLimiter<IpAddr>>,
}

impl OrdersModule {
    /// The catalog is validated here so handlers can rely on one-level bundles.
    pub fn new(catalog: Catalog, limiter: Arc<RateLimiter<IpAddr>>) -> Result<Self> {
        catalog
            .validate()
            .map_err(|e| Error::Config(format!("invalid catalog: {e}")))?;
        Ok(Self {
            catalog: Arc::new(catalog),
            limiter,
        })
    }
}

impl Module for OrdersModule {
    fn name(&self) -> &'static str {
        "orders"
    }

    fn routes(&self, router: &mut Router) {
        let catalog = Arc::clone(&self.catalog);
        let limiter = Arc::clone(&self.limiter);
        router.post("/api/orders/requirements", move |ctx| {
            let catalog = Arc::clone(&catalog);
            let limiter = Arc::clone(&limiter);
            async move {
                ctx.limit(&limiter, REQUIREMENTS_COST)?;
                let req: RequirementsRequest = ctx.json()?;

                if let Some(item) = req.items.iter().find(|item| item.quantity == 0) {
                    return Err(Error::BadRequest(format!(
                        "quantity for {} must be positive",
                        item.product_id
                    )));
                }

                let requirements = if req.strict {
                    inventory::required_quantities_strict(&req.items, &catalog)?
                } else {
                    inventory::required_quantities(&req.items, &catalog)
                };
                response::ok(&RequirementsResponse { requirements })
            }
        });

        let catalog = Arc::clone(&self.catalog);
        router.get("/api/catalog/{id}", move |ctx| {
            let catalog = Arc::clone(&catalog);
            async move {
                let id = ctx.require_param("id")?;
                let kind = catalog
                    .kind_of(id)
                    .ok_or_else(|| Error::NotFound(format!("product {id}")))?;
                response::ok(&ProductView {
                    id,
                    kind,
                    components: catalog.components_of(id),
                })
            }
        });
    }
}

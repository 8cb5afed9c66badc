//! Bundle expansion for order line items.
//!
//! A catalog product is either simple (stocked on its own) or a bundle (a
//! fixed recipe of simple products). Before stock can be checked or
//! decremented, an order's lines have to be translated into the total units
//! of each simple product they consume.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Whether a product is stocked directly or composed of other products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Simple,
    Bundle,
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    pub quantity: u32,
}

impl LineItem {
    pub fn new(product_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// Units of a simple product contained in one unit of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub product_id: String,
    pub quantity: u32,
}

impl Component {
    pub fn new(product_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// Total units required per simple product id.
pub type Requirements = BTreeMap<String, u64>;

/// Product kind and bundle composition lookups.
///
/// Populated by whoever owns the product store; this type only describes
/// the shape the expander reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub kinds: HashMap<String, ProductKind>,
    #[serde(default)]
    pub bundles: HashMap<String, Vec<Component>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a simple product.
    pub fn simple(mut self, id: impl Into<String>) -> Self {
        self.kinds.insert(id.into(), ProductKind::Simple);
        self
    }

    /// Register a bundle and its components.
    pub fn bundle(mut self, id: impl Into<String>, components: Vec<Component>) -> Self {
        let id = id.into();
        self.kinds.insert(id.clone(), ProductKind::Bundle);
        self.bundles.insert(id, components);
        self
    }

    pub fn kind_of(&self, id: &str) -> Option<ProductKind> {
        self.kinds.get(id).copied()
    }

    /// Components of a bundle; empty when none are registered.
    pub fn components_of(&self, id: &str) -> &[Component] {
        self.bundles.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check that bundles are one level deep and reference known simple
    /// products.
    pub fn validate(&self) -> Result<()> {
        // Sorted so the reported violation is deterministic.
        let mut bundle_ids: Vec<&String> = self.bundles.keys().collect();
        bundle_ids.sort();

        for id in bundle_ids {
            if self.kind_of(id) != Some(ProductKind::Bundle) {
                return Err(Error::BadRequest(format!(
                    "product {id} has components but is not a bundle"
                )));
            }
            for component in &self.bundles[id] {
                if component.product_id == *id {
                    return Err(Error::BadRequest(format!("bundle {id} contains itself")));
                }
                match self.kind_of(&component.product_id) {
                    Some(ProductKind::Simple) => {}
                    Some(ProductKind::Bundle) => {
                        return Err(Error::BadRequest(format!(
                            "bundle {id} nests bundle {}",
                            component.product_id
                        )));
                    }
                    None => {
                        return Err(Error::BadRequest(format!(
                            "bundle {id} references unknown product {}",
                            component.product_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Total simple-product units required to fulfil `items`.
///
/// Simple lines count directly; bundle lines count each component times the
/// line quantity. Items whose product is not in the catalog contribute
/// nothing, as do bundles with no registered components. Bundles are
/// expanded one level only.
pub fn required_quantities<'a, I>(items: I, catalog: &Catalog) -> Requirements
where
    I: IntoIterator<Item = &'a LineItem>,
{
    let mut required = Requirements::new();
    for item in items {
        match catalog.kind_of(&item.product_id) {
            Some(kind) => accumulate(&mut required, item, kind, catalog),
            None => debug!(product_id = %item.product_id, "skipping unknown product"),
        }
    }
    required
}

/// Like [`required_quantities`], but an item referencing a product missing
/// from the catalog is an error instead of being skipped.
pub fn required_quantities_strict<'a, I>(items: I, catalog: &Catalog) -> Result<Requirements>
where
    I: IntoIterator<Item = &'a LineItem>,
{
    let mut required = Requirements::new();
    for item in items {
        let kind = catalog
            .kind_of(&item.product_id)
            .ok_or_else(|| Error::NotFound(format!("product {}", item.product_id)))?;
        accumulate(&mut required, item, kind, catalog);
    }
    Ok(required)
}

fn accumulate(required: &mut Requirements, item: &LineItem, kind: ProductKind, catalog: &Catalog) {
    match kind {
        ProductKind::Simple => add(required, &item.product_id, u64::from(item.quantity)),
        ProductKind::Bundle => {
            for component in catalog.components_of(&item.product_id) {
                let units = u64::from(item.quantity) * u64::from(component.quantity);
                add(required, &component.product_id, units);
            }
        }
    }
}

fn add(required: &mut Requirements, product_id: &str, units: u64) {
    let entry = required.entry(product_id.to_string()).or_insert(0);
    *entry = entry.saturating_add(units);
}

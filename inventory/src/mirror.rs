//! Product activity mirror.
//!
//! An eventually-consistent `product → active` lookup rebuilt purely from
//! upstream catalog lifecycle events (`product.published`,
//! `product.deactivated`, `product.deleted`). It is consulted synchronously
//! by `Reserve` but is never authoritative: the accepted staleness window is
//! the mirror's consumer lag.
//!
//! Products the mirror has never seen are treated as active. Failing closed
//! on unknown products would block sales whenever the mirror lags behind a
//! newly published product.

use souk_core::model::ProductId;
use std::collections::HashMap;
use std::sync::RwLock;

/// Upstream product lifecycle facts the mirror understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductLifecycle {
    /// Product became purchasable.
    Published,
    /// Product was taken off sale.
    Deactivated,
    /// Product was removed entirely.
    Deleted,
}

impl ProductLifecycle {
    /// Map a wire event type to a lifecycle fact.
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "product.published" => Some(Self::Published),
            "product.deactivated" => Some(Self::Deactivated),
            "product.deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// In-memory `product → active` mirror.
#[derive(Debug, Default)]
pub struct ProductActivityMirror {
    active: RwLock<HashMap<ProductId, bool>>,
}

impl ProductActivityMirror {
    /// Create an empty mirror (everything reservable until told otherwise).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an upstream lifecycle fact.
    pub fn apply(&self, product_id: ProductId, lifecycle: ProductLifecycle) {
        let active = matches!(lifecycle, ProductLifecycle::Published);
        if let Ok(mut map) = self.active.write() {
            map.insert(product_id.clone(), active);
        }
        tracing::debug!(product_id = %product_id, ?lifecycle, "Product activity mirror updated");
    }

    /// Whether the product is reservable as far as the mirror knows.
    #[must_use]
    pub fn is_active(&self, product_id: &ProductId) -> bool {
        self.active
            .read()
            .map(|map| map.get(product_id).copied().unwrap_or(true))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_products_are_reservable() {
        let mirror = ProductActivityMirror::new();
        assert!(mirror.is_active(&ProductId("never-seen".into())));
    }

    #[test]
    fn lifecycle_toggles_activity() {
        let mirror = ProductActivityMirror::new();
        let p = ProductId("p1".into());

        mirror.apply(p.clone(), ProductLifecycle::Deactivated);
        assert!(!mirror.is_active(&p));

        mirror.apply(p.clone(), ProductLifecycle::Published);
        assert!(mirror.is_active(&p));

        mirror.apply(p.clone(), ProductLifecycle::Deleted);
        assert!(!mirror.is_active(&p));
    }

    #[test]
    fn event_types_map_to_lifecycle() {
        assert_eq!(
            ProductLifecycle::from_event_type("product.published"),
            Some(ProductLifecycle::Published)
        );
        assert_eq!(ProductLifecycle::from_event_type("product.renamed"), None);
    }
}

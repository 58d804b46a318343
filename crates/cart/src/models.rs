//! Cart Models

use serde::{Deserialize, Serialize};

use crate::uuids::TypedUuid;

/// Cart Line Item UUID
pub type CartItemUuid = TypedUuid<CartLineItem>;

/// Product UUID
pub type ProductUuid = TypedUuid<Product>;

/// Marker for product identifiers. Products themselves live in the catalog.
#[derive(Debug)]
pub enum Product {}

/// One product/variant/quantity entry in the cart.
///
/// Prices are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLineItem {
    /// Identifier of the line as known to the remote cart.
    pub id: CartItemUuid,
    /// The product this line buys.
    pub product_id: ProductUuid,
    /// Display name of the product.
    pub product_name: String,
    /// Image URL, when the product has one.
    #[serde(default)]
    pub product_image: Option<String>,
    /// Always at least one while the line is in a cart.
    pub quantity: u32,
    /// List price per unit.
    pub unit_price: u64,
    /// Promotional unit price, when a promotion applies to this line.
    #[serde(default)]
    pub applied_price: Option<u64>,
    /// Colour variant.
    #[serde(default)]
    pub color: Option<String>,
    /// Storage variant.
    #[serde(default)]
    pub storage: Option<String>,
}

impl CartLineItem {
    /// The price charged per unit, preferring a promotional price when one applies.
    pub fn effective_price(&self) -> u64 {
        self.applied_price.unwrap_or(self.unit_price)
    }

    /// Quantity multiplied by the effective unit price.
    pub fn line_total(&self) -> u64 {
        self.effective_price()
            .saturating_mul(u64::from(self.quantity))
    }

    /// Whether both lines describe the same purchasable SKU variant.
    pub fn same_variant(&self, other: &Self) -> bool {
        self.product_id == other.product_id
            && self.color == other.color
            && self.storage == other.storage
    }

    /// The add request that would recreate this line remotely.
    #[must_use]
    pub fn to_new_item(&self) -> NewCartItem {
        NewCartItem {
            product_id: self.product_id,
            quantity: self.quantity,
            color: self.color.clone(),
            storage: self.storage.clone(),
        }
    }
}

/// New Cart Item Data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCartItem {
    /// Product to add.
    pub product_id: ProductUuid,
    /// Units to add.
    pub quantity: u32,
    /// Colour variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Storage variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

/// The authoritative cart as returned by the remote API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RemoteCart {
    /// Every line, in the order the remote lists them.
    #[serde(default)]
    pub items: Vec<CartLineItem>,
}

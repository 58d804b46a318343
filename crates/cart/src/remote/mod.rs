//! Remote cart API.
//!
//! The system of record for the cart. Everything here is consumed, never
//! served: [`HttpCartApi`] speaks to the storefront backend, and tests
//! substitute [`MockCartApi`].

use async_trait::async_trait;
use mockall::automock;

use crate::models::{CartItemUuid, CartLineItem, NewCartItem, RemoteCart};

pub mod errors;
mod http;

pub use errors::{CartApiError, CartErrorKind, RemoteFailure, classify};
pub use http::HttpCartApi;

/// Operations offered by the remote cart.
#[automock]
#[async_trait]
pub trait CartApi: Send + Sync {
    /// Fetch the authoritative cart.
    async fn get_current_cart(&self) -> Result<RemoteCart, CartApiError>;

    /// Add a product to the cart, returning the created line.
    async fn add_item(&self, item: NewCartItem) -> Result<CartLineItem, CartApiError>;

    /// Set a line's quantity. The updated line is returned when the remote
    /// includes it.
    async fn update_item_quantity(
        &self,
        id: CartItemUuid,
        quantity: u32,
    ) -> Result<Option<CartLineItem>, CartApiError>;

    /// Remove a line.
    async fn remove_item(&self, id: CartItemUuid) -> Result<(), CartApiError>;

    /// Remove every line in one request.
    async fn clear_cart(&self) -> Result<(), CartApiError>;
}

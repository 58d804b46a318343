//! Cart session errors.

use thiserror::Error;

use crate::{models::CartItemUuid, remote::CartApiError};

/// Errors returned by [`CartSession`](crate::CartSession) operations.
#[derive(Debug, Error)]
pub enum CartSessionError {
    /// The line is not in the local cart.
    #[error("line item {0} is not in the cart")]
    ItemNotFound(CartItemUuid),

    /// None of the lines asked for are in the local cart.
    #[error("none of the requested line items are in the cart")]
    NothingToRemove,

    /// The remote cart could not be reached or refused the request.
    #[error("cart API error")]
    Api(#[from] CartApiError),
}

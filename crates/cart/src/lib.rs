//! Storefront Cart
//!
//! Optimistic cart editing against a remote cart API. Every edit is applied
//! to the local [`store`] first. Removals wait out an undo grace window in the
//! [`scheduler`] before they are sent, remote failures are turned into local
//! corrections by the [`reconciler`], and clearing the cart can be undone by
//! replaying the cleared lines through [`undo`].
//!
//! [`session::CartSession`] ties these together.

pub mod config;
pub mod errors;
pub mod models;
pub mod notifications;
pub mod observability;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod undo;
pub mod uuids;

#[cfg(test)]
mod test_support;

pub use errors::CartSessionError;
pub use session::{CartSession, QuantityChange};

//! Local Cart Store
//!
//! The in-memory list of line items the interface renders. Every mutation is
//! synchronous, never touches the network and hands back the resulting
//! [`CartSnapshot`]. Observers can [`subscribe`](CartStore::subscribe) to be
//! woken on each change.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::models::{CartItemUuid, CartLineItem};

/// An immutable view of the cart at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartSnapshot {
    items: Arc<[CartLineItem]>,
}

impl CartSnapshot {
    fn from_items(items: Vec<CartLineItem>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// Line items in display order.
    pub fn items(&self) -> &[CartLineItem] {
        &self.items
    }

    /// Look up a line by id.
    pub fn get(&self, id: CartItemUuid) -> Option<&CartLineItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Whether the line is in the cart.
    pub fn contains(&self, id: CartItemUuid) -> bool {
        self.get(id).is_some()
    }

    /// Number of lines.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the cart has no lines.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of quantities over all lines.
    pub fn total_items(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.quantity)).sum()
    }

    /// Sum of line totals, using the promotional price where one applies.
    pub fn total_price(&self) -> u64 {
        self.items
            .iter()
            .fold(0_u64, |total, item| total.saturating_add(item.line_total()))
    }
}

/// Injectable handle to the local cart state. Clones share the same state.
#[derive(Debug, Clone)]
pub struct CartStore {
    sender: Arc<watch::Sender<CartSnapshot>>,
}

impl Default for CartStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CartStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(CartSnapshot::default());

        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create a store seeded with `items`.
    #[must_use]
    pub fn with_items(items: Vec<CartLineItem>) -> Self {
        let store = Self::new();

        store.set_items(items);

        store
    }

    /// The current state.
    pub fn snapshot(&self) -> CartSnapshot {
        self.sender.borrow().clone()
    }

    /// Watch for changes. The receiver starts at the current state.
    pub fn subscribe(&self) -> watch::Receiver<CartSnapshot> {
        self.sender.subscribe()
    }

    /// Replace the whole list. Zero-quantity lines and repeated ids are dropped.
    pub fn set_items(&self, items: Vec<CartLineItem>) -> CartSnapshot {
        let mut seen = FxHashSet::default();

        let items = items
            .into_iter()
            .filter(|item| {
                if item.quantity == 0 {
                    warn!(item = %item.id, "dropping zero-quantity line");
                    return false;
                }

                if !seen.insert(item.id) {
                    warn!(item = %item.id, "dropping duplicate line");
                    return false;
                }

                true
            })
            .collect::<Vec<_>>();

        self.mutate(|current| {
            *current = items;
            true
        })
    }

    /// Set the quantity of a line. A quantity of zero removes the line.
    pub fn update_quantity(&self, id: CartItemUuid, quantity: u32) -> CartSnapshot {
        if quantity == 0 {
            return self.remove_item(id);
        }

        self.mutate(|items| {
            let Some(item) = items.iter_mut().find(|item| item.id == id) else {
                debug!(item = %id, "quantity update for absent line ignored");
                return false;
            };

            if item.quantity == quantity {
                return false;
            }

            item.quantity = quantity;

            true
        })
    }

    /// Lower a line's quantity to at most `max`. A limit of zero removes the line.
    pub fn clamp_quantity(&self, id: CartItemUuid, max: u32) -> CartSnapshot {
        if max == 0 {
            return self.remove_item(id);
        }

        self.mutate(|items| match items.iter_mut().find(|item| item.id == id) {
            Some(item) if item.quantity > max => {
                item.quantity = max;
                true
            }
            _ => false,
        })
    }

    /// Overwrite a line with a fresher copy of itself, keeping its position.
    pub fn replace_item(&self, replacement: CartLineItem) -> CartSnapshot {
        if replacement.quantity == 0 {
            return self.remove_item(replacement.id);
        }

        self.mutate(|items| {
            let Some(item) = items.iter_mut().find(|item| item.id == replacement.id) else {
                return false;
            };

            if *item == replacement {
                return false;
            }

            *item = replacement;

            true
        })
    }

    /// Remove a line. Removing an absent line is a no-op.
    pub fn remove_item(&self, id: CartItemUuid) -> CartSnapshot {
        self.remove_items(&[id])
    }

    /// Remove every listed line that is present.
    pub fn remove_items(&self, ids: &[CartItemUuid]) -> CartSnapshot {
        self.mutate(|items| {
            let before = items.len();

            items.retain(|item| !ids.contains(&item.id));

            items.len() != before
        })
    }

    /// Drop every line.
    pub fn clear(&self) -> CartSnapshot {
        self.mutate(|items| {
            let changed = !items.is_empty();

            items.clear();

            changed
        })
    }

    /// Put a previously removed line back at the head of the list.
    pub fn restore_item(&self, item: CartLineItem) -> CartSnapshot {
        self.restore_items(vec![item])
    }

    /// Put several lines back at the head of the list, keeping their relative
    /// order. Any line already present under the same id is moved, not copied.
    pub fn restore_items(&self, restored: Vec<CartLineItem>) -> CartSnapshot {
        let restored = restored
            .into_iter()
            .filter(|item| item.quantity > 0)
            .collect::<Vec<_>>();

        if restored.is_empty() {
            return self.snapshot();
        }

        self.mutate(|items| {
            items.retain(|item| !restored.iter().any(|r| r.id == item.id));

            let mut next = restored;

            next.append(items);

            *items = next;

            true
        })
    }

    fn mutate<F>(&self, apply: F) -> CartSnapshot
    where
        F: FnOnce(&mut Vec<CartLineItem>) -> bool,
    {
        let mut current = CartSnapshot::default();

        self.sender.send_if_modified(|snapshot| {
            let mut items = snapshot.items.to_vec();
            let changed = apply(&mut items);

            if changed {
                *snapshot = CartSnapshot::from_items(items);
            }

            current = snapshot.clone();

            changed
        });

        current
    }
}

//! Remote reconciliation.
//!
//! When the remote cart rejects a quantity change or a deferred removal, the
//! failure is classified once and turned into a single [`Correction`] of the
//! local store, followed by exactly one notice.
//!
//! | Failure | Correction |
//! |---|---|
//! | line not found | drop the line |
//! | available stock is zero | drop the line |
//! | available stock is `n` | clamp the line to `n` |
//! | conflict | reload the whole cart |
//! | anything else | revert the optimistic change |

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    num::NonZeroU32,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rustc_hash::FxHashMap;
use tracing::{debug, info, instrument, warn};

use crate::{
    models::{CartItemUuid, CartLineItem},
    notifications::{Notice, Notifier},
    remote::{CartApi, CartApiError, CartErrorKind, classify},
    scheduler::DeleteScheduler,
    store::{CartSnapshot, CartStore},
};

/// Why a line was dropped from the cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The line no longer exists remotely.
    Vanished,

    /// Nothing is left in stock.
    OutOfStock,
}

/// The local edit chosen for a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// Take the line out of the cart.
    Drop(DropReason),

    /// Lower the line to what is in stock.
    Clamp {
        /// Units the remote can supply.
        available: u32,
    },

    /// Replace the cart with the remote copy.
    Reload,

    /// Undo the local change.
    Revert,
}

impl Correction {
    /// Pick the correction for a classified failure.
    pub fn for_failure(kind: CartErrorKind) -> Self {
        match kind {
            CartErrorKind::NotFound => Self::Drop(DropReason::Vanished),
            CartErrorKind::InsufficientStock { available: 0 } => {
                Self::Drop(DropReason::OutOfStock)
            }
            CartErrorKind::InsufficientStock { available } => Self::Clamp { available },
            CartErrorKind::Conflict => Self::Reload,
            CartErrorKind::Unknown => Self::Revert,
        }
    }
}

/// What was changed locally ahead of the remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimisticChange {
    /// The quantity of `previous` was changed; `previous` holds the value
    /// before the change.
    Quantity {
        /// The line before its quantity changed.
        previous: CartLineItem,
    },

    /// `removed` was taken out of the store.
    Removal {
        /// The line that was removed.
        removed: CartLineItem,
    },
}

impl OptimisticChange {
    /// The line as it was before the change.
    pub fn line(&self) -> &CartLineItem {
        match self {
            Self::Quantity { previous } => previous,
            Self::Removal { removed } => removed,
        }
    }
}

/// Result of a quantity update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityOutcome {
    /// The remote accepted the new quantity.
    Saved,

    /// The remote refused and the store was corrected.
    Corrected(Correction),

    /// A newer update for the same line was issued before this one returned,
    /// so its response was ignored.
    Superseded,

    /// The line is not in the cart.
    NotInCart,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sequence: u64,
    confirmed: u32,
}

/// Quantity requests still waiting on a response, per line.
#[derive(Debug, Default)]
struct Sequences {
    next: u64,
    in_flight: FxHashMap<CartItemUuid, InFlight>,
}

impl Sequences {
    /// Number a new request. The first request of a burst records the
    /// quantity the line had before it.
    fn begin(&mut self, item: CartItemUuid, displayed: u32) -> u64 {
        self.next += 1;
        let sequence = self.next;

        self.in_flight
            .entry(item)
            .and_modify(|in_flight| in_flight.sequence = sequence)
            .or_insert(InFlight {
                sequence,
                confirmed: displayed,
            });

        sequence
    }

    /// Close the request numbered `sequence`. Returns the pre-burst quantity
    /// when this was the latest request for the line, `None` when stale.
    fn finish(&mut self, item: CartItemUuid, sequence: u64) -> Option<u32> {
        match self.in_flight.get(&item) {
            Some(in_flight) if in_flight.sequence == sequence => self
                .in_flight
                .remove(&item)
                .map(|in_flight| in_flight.confirmed),
            _ => None,
        }
    }
}

/// Releases a quantity request's slot when its future is dropped before the
/// response is reconciled.
struct InFlightGuard<'a> {
    sequences: &'a Mutex<Sequences>,
    item: CartItemUuid,
    sequence: u64,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn lock(&self) -> MutexGuard<'_, Sequences> {
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(mut self) -> Option<u32> {
        self.armed = false;

        self.lock().finish(self.item, self.sequence)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lock().finish(self.item, self.sequence);
        }
    }
}

/// Applies remote outcomes to the local store.
#[derive(Clone)]
pub struct Reconciler {
    api: Arc<dyn CartApi>,
    store: CartStore,
    scheduler: DeleteScheduler,
    notifier: Arc<dyn Notifier>,
    sequences: Arc<Mutex<Sequences>>,
}

impl Debug for Reconciler {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Reconciler")
            .field("store", &self.store)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// A reconciler writing corrections to `store`. Reloads leave out lines
    /// `scheduler` has not settled.
    #[must_use]
    pub fn new(
        api: Arc<dyn CartApi>,
        store: CartStore,
        scheduler: DeleteScheduler,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            api,
            store,
            scheduler,
            notifier,
            sequences: Arc::default(),
        }
    }

    fn sequences(&self) -> MutexGuard<'_, Sequences> {
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Change a line's quantity locally, send it, and reconcile the response.
    ///
    /// Only the response to the most recent update of a line is acted on.
    #[instrument(skip(self), fields(item = %id))]
    pub async fn update_quantity(
        &self,
        id: CartItemUuid,
        quantity: NonZeroU32,
    ) -> QuantityOutcome {
        let Some(mut previous) = self.store.snapshot().get(id).cloned() else {
            return QuantityOutcome::NotInCart;
        };

        let guard = InFlightGuard {
            sequences: &self.sequences,
            item: id,
            sequence: self.sequences().begin(id, previous.quantity),
            armed: true,
        };
        let sequence = guard.sequence;

        self.store.update_quantity(id, quantity.get());

        let result = self.api.update_item_quantity(id, quantity.get()).await;

        let confirmed = guard.finish();

        let Some(confirmed) = confirmed else {
            debug!(sequence, "discarding response to superseded quantity update");
            return QuantityOutcome::Superseded;
        };

        match result {
            Ok(Some(line)) if line.id == id => {
                self.store.replace_item(line);
                QuantityOutcome::Saved
            }
            Ok(_) => QuantityOutcome::Saved,
            Err(error) => {
                let kind = classify(&error);

                warn!(%error, ?kind, "quantity update rejected");

                previous.quantity = confirmed;

                let correction = Correction::for_failure(kind);

                self.apply(&OptimisticChange::Quantity { previous }, correction)
                    .await;

                QuantityOutcome::Corrected(correction)
            }
        }
    }

    /// Reconcile a deferred removal whose commit failed.
    #[instrument(skip(self, removed, error), fields(item = %removed.id))]
    pub async fn reconcile_failed_delete(
        &self,
        removed: CartLineItem,
        error: &CartApiError,
    ) -> Correction {
        let kind = classify(error);
        let correction = Correction::for_failure(kind);

        warn!(%error, ?kind, "removal rejected");

        self.apply(&OptimisticChange::Removal { removed }, correction)
            .await;

        correction
    }

    /// Replace the store with the remote cart, leaving out lines whose removal
    /// is still pending or being committed.
    ///
    /// # Errors
    ///
    /// Returns an error when the remote cart cannot be fetched; the store is
    /// left untouched.
    pub async fn reload(&self) -> Result<CartSnapshot, CartApiError> {
        let cart = self.api.get_current_cart().await?;

        let unsettled = self.scheduler.unsettled_members();

        let items = cart
            .items
            .into_iter()
            .filter(|item| !unsettled.contains(&item.id))
            .collect();

        let snapshot = self.store.set_items(items);

        info!(lines = snapshot.len(), "cart reloaded from remote");

        Ok(snapshot)
    }

    /// Carry out `correction` for `change` and notify the shopper.
    pub async fn apply(&self, change: &OptimisticChange, correction: Correction) {
        let line = change.line();

        match correction {
            Correction::Drop(reason) => {
                self.store.remove_item(line.id);

                let name = line.product_name.clone();

                self.notifier.notify(match reason {
                    DropReason::Vanished => Notice::ItemDropped { name },
                    DropReason::OutOfStock => Notice::OutOfStock { name },
                });
            }
            Correction::Clamp { available } => self.clamp(change, available),
            Correction::Reload => match self.reload().await {
                Ok(_) => self.notifier.notify(Notice::CartReloaded),
                Err(error) => {
                    warn!(%error, "reload after conflict failed, reverting instead");
                    self.revert(change);
                }
            },
            Correction::Revert => self.revert(change),
        }
    }

    fn clamp(&self, change: &OptimisticChange, available: u32) {
        let line = change.line();

        let snapshot = match change {
            OptimisticChange::Removal { removed }
                if !self.store.snapshot().contains(removed.id) =>
            {
                let mut restored = removed.clone();

                restored.quantity = restored.quantity.min(available);

                self.store.restore_item(restored)
            }
            _ => self.store.clamp_quantity(line.id, available),
        };

        if let Some(current) = snapshot.get(line.id) {
            self.notifier.notify(Notice::QuantityReduced {
                name: current.product_name.clone(),
                quantity: current.quantity,
            });
        }
    }

    fn revert(&self, change: &OptimisticChange) {
        match change {
            OptimisticChange::Quantity { previous } => {
                if self.store.snapshot().contains(previous.id) {
                    self.store.update_quantity(previous.id, previous.quantity);
                }

                self.notifier.notify(Notice::UpdateFailed {
                    name: previous.product_name.clone(),
                });
            }
            OptimisticChange::Removal { removed } => {
                self.store.restore_item(removed.clone());

                self.notifier.notify(Notice::RemoveFailed {
                    name: removed.product_name.clone(),
                });
            }
        }
    }
}

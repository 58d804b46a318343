//! Cart session.
//!
//! [`CartSession`] is the surface a storefront binds to: it owns the store,
//! the deferred-removal scheduler, the reconciler and the clear-cart undo,
//! and wires remote outcomes from each back into the store.

use std::{
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    num::NonZeroU32,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::{
    config::CartConfig,
    errors::CartSessionError,
    models::{CartItemUuid, CartLineItem},
    notifications::{Notice, Notifier},
    reconciler::{QuantityOutcome, Reconciler},
    remote::{CartApi, CartApiError, HttpCartApi},
    scheduler::{BatchUuid, DeleteScheduler, Members, MutationKey, PendingMutation, PendingSummary},
    store::{CartSnapshot, CartStore},
    undo::{ClearCartUndo, ClearOutcome, UndoOutcome},
};

/// Result of [`CartSession::update_quantity`].
#[derive(Debug, Clone)]
pub enum QuantityChange {
    /// The new quantity was sent.
    Updated(QuantityOutcome),

    /// A quantity of zero removes the line, with undo.
    RemovalScheduled(PendingMutation),
}

/// Lines whose removal the remote refused.
#[derive(Debug)]
struct RemovalFailures(Vec<(CartLineItem, CartApiError)>);

impl Display for RemovalFailures {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{} removal(s) refused", self.0.len())
    }
}

/// Removed lines held until their removal commits or is undone.
#[derive(Debug, Clone, Default)]
struct Parked(Arc<Mutex<FxHashMap<CartItemUuid, CartLineItem>>>);

impl Parked {
    fn lock(&self) -> MutexGuard<'_, FxHashMap<CartItemUuid, CartLineItem>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn park(&self, items: &[CartLineItem]) {
        self.lock()
            .extend(items.iter().map(|item| (item.id, item.clone())));
    }

    /// Take the parked lines for `ids`, in the order given.
    fn take(&self, ids: &[CartItemUuid]) -> Vec<CartLineItem> {
        let mut parked = self.lock();

        ids.iter().filter_map(|id| parked.remove(id)).collect()
    }

    fn forget(&self, ids: impl IntoIterator<Item = CartItemUuid>) {
        let mut parked = self.lock();

        for id in ids {
            parked.remove(&id);
        }
    }
}

/// One shopper's cart.
#[derive(Clone)]
pub struct CartSession {
    api: Arc<dyn CartApi>,
    store: CartStore,
    scheduler: DeleteScheduler,
    reconciler: Reconciler,
    clear_undo: ClearCartUndo,
    notifier: Arc<dyn Notifier>,
    parked: Parked,
}

impl Debug for CartSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("CartSession")
            .field("store", &self.store)
            .field("scheduler", &self.scheduler)
            .field("clear_undo", &self.clear_undo)
            .finish_non_exhaustive()
    }
}

impl CartSession {
    /// Start an empty session. Call [`refresh`](Self::refresh) to load the
    /// remote cart.
    #[must_use]
    pub fn new(api: Arc<dyn CartApi>, notifier: Arc<dyn Notifier>, grace: Duration) -> Self {
        let store = CartStore::new();
        let scheduler = DeleteScheduler::new(grace);

        let reconciler = Reconciler::new(
            Arc::clone(&api),
            store.clone(),
            scheduler.clone(),
            Arc::clone(&notifier),
        );

        let clear_undo = ClearCartUndo::new(
            Arc::clone(&api),
            store.clone(),
            reconciler.clone(),
            Arc::clone(&notifier),
        );

        Self {
            api,
            store,
            scheduler,
            reconciler,
            clear_undo,
            notifier,
            parked: Parked::default(),
        }
    }

    /// Build a session that talks to the HTTP cart API.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(
        config: &CartConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, CartSessionError> {
        let api = HttpCartApi::new(config)?;

        Ok(Self::new(Arc::new(api), notifier, config.grace()))
    }

    /// The local store backing this session.
    pub fn store(&self) -> &CartStore {
        &self.store
    }

    /// The cart as currently shown.
    pub fn snapshot(&self) -> CartSnapshot {
        self.store.snapshot()
    }

    /// Watch the cart. The receiver sees every change, including corrections
    /// made after a remote failure.
    pub fn subscribe(&self) -> watch::Receiver<CartSnapshot> {
        self.store.subscribe()
    }

    /// Removals still inside their undo window.
    pub fn pending(&self) -> Vec<PendingSummary> {
        self.scheduler.pending()
    }

    /// Load the remote cart into the store.
    ///
    /// # Errors
    ///
    /// Returns an error when the cart cannot be fetched.
    pub async fn refresh(&self) -> Result<CartSnapshot, CartSessionError> {
        Ok(self.reconciler.reload().await?)
    }

    /// Remove a line now and commit the removal once the grace window passes.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not in the cart.
    #[instrument(skip(self))]
    pub fn schedule_delete(&self, id: CartItemUuid) -> Result<PendingMutation, CartSessionError> {
        let Some(item) = self.store.snapshot().get(id).cloned() else {
            return Err(CartSessionError::ItemNotFound(id));
        };

        self.store.remove_item(id);

        let name = item.product_name.clone();
        let pending = self.schedule_removal(MutationKey::Item(id), vec![item]);

        self.notifier.notify(Notice::ItemRemoved { name });

        Ok(pending)
    }

    /// Bring back a line whose removal has not been sent yet.
    ///
    /// Returns `false` once the removal has been committed or is in flight.
    pub fn undo_delete(&self, id: CartItemUuid) -> bool {
        self.undo_multiple(&[id]) == 1
    }

    /// Remove several lines as one undoable batch.
    ///
    /// Ids not in the cart are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if none of `ids` are in the cart.
    #[instrument(skip(self))]
    pub fn remove_items(&self, ids: &[CartItemUuid]) -> Result<PendingMutation, CartSessionError> {
        let items = self
            .store
            .snapshot()
            .items()
            .iter()
            .filter(|item| ids.contains(&item.id))
            .cloned()
            .collect::<Vec<_>>();

        if items.is_empty() {
            return Err(CartSessionError::NothingToRemove);
        }

        let removed = items.iter().map(|item| item.id).collect::<Vec<_>>();
        let count = items.len();

        self.store.remove_items(&removed);

        let pending = self.schedule_removal(MutationKey::Batch(BatchUuid::now_v7()), items);

        self.notifier.notify(Notice::ItemsRemoved { count });

        Ok(pending)
    }

    /// Bring back any of `ids` whose removal is still pending, with a single
    /// notice. Other lines of an affected batch stay removed and get a fresh
    /// grace window.
    ///
    /// Returns how many lines were restored.
    #[instrument(skip(self))]
    pub fn undo_multiple(&self, ids: &[CartItemUuid]) -> usize {
        let mut restored = Vec::new();

        for (key, members) in self.scheduler.cancel_many(ids) {
            let (undone, remaining): (Members, Members) =
                members.into_iter().partition(|member| ids.contains(member));

            restored.extend(self.parked.take(&undone));

            if !remaining.is_empty() {
                debug!(?key, remaining = remaining.len(), "rescheduling rest of batch");

                let rest = self.parked.take(&remaining);
                self.schedule_removal(key, rest);
            }
        }

        let count = restored.len();

        if count == 0 {
            return 0;
        }

        self.store.restore_items(restored);
        self.notifier.notify(Notice::ItemsRestored { count });

        info!(count, "removal undone");

        count
    }

    /// Set a line's quantity. Zero schedules the line's removal instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not in the cart.
    pub async fn update_quantity(
        &self,
        id: CartItemUuid,
        quantity: u32,
    ) -> Result<QuantityChange, CartSessionError> {
        let Some(quantity) = NonZeroU32::new(quantity) else {
            return self
                .schedule_delete(id)
                .map(QuantityChange::RemovalScheduled);
        };

        match self.reconciler.update_quantity(id, quantity).await {
            QuantityOutcome::NotInCart => Err(CartSessionError::ItemNotFound(id)),
            outcome => Ok(QuantityChange::Updated(outcome)),
        }
    }

    /// Empty the cart. Pending removals are dropped once the clear succeeds,
    /// since the clear already covers them.
    pub async fn clear_cart(&self) -> ClearOutcome {
        let outcome = self.clear_undo.clear().await;

        if outcome == ClearOutcome::Cleared {
            let dropped = self.scheduler.cancel_all();

            self.parked.forget(dropped);
        }

        outcome
    }

    /// Add the lines of the last clear back to the cart.
    pub async fn undo_clear(&self) -> UndoOutcome {
        self.clear_undo.undo().await
    }

    /// Whether a cleared cart can be brought back.
    pub fn can_undo_clear(&self) -> bool {
        self.clear_undo.can_undo()
    }

    /// Commit every pending removal now and wait for them to settle.
    pub async fn flush_pending(&self) {
        self.scheduler.flush().await;
    }

    fn schedule_removal(&self, key: MutationKey, items: Vec<CartLineItem>) -> PendingMutation {
        let members = items.iter().map(|item| item.id).collect::<Members>();

        self.parked.park(&items);

        let api = Arc::clone(&self.api);
        let parked = self.parked.clone();
        let reconciler = self.reconciler.clone();

        let commit = async move {
            let api = &api;

            let results = join_all(items.into_iter().map(|item| async move {
                let result = api.remove_item(item.id).await;

                (item, result)
            }))
            .await;

            parked.forget(results.iter().map(|(item, _)| item.id));

            let failures = results
                .into_iter()
                .filter_map(|(item, result)| result.err().map(|error| (item, error)))
                .collect::<Vec<_>>();

            if failures.is_empty() {
                Ok(())
            } else {
                Err(RemovalFailures(failures))
            }
        };

        let restore = move |RemovalFailures(failures): RemovalFailures| async move {
            for (item, error) in failures {
                reconciler.reconcile_failed_delete(item, &error).await;
            }
        };

        self.scheduler.schedule(key, members, commit, restore)
    }
}

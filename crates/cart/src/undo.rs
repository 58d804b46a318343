//! Clear-cart with compensating undo.
//!
//! Clearing is committed remotely in a single request, so undo cannot cancel
//! anything. Instead the cleared lines are kept and, on undo, added back one
//! request at a time before the authoritative cart is fetched.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{info, instrument, warn};

use crate::{
    models::CartLineItem,
    notifications::{Notice, Notifier},
    reconciler::Reconciler,
    remote::CartApi,
    store::CartStore,
};

/// Result of clearing the cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    /// The remote cart was emptied; undo is available.
    Cleared,

    /// The request failed; the store was not touched.
    Failed,
}

/// Result of undoing a clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    /// Every cleared line was added back.
    Restored {
        /// Lines added back.
        lines: usize,
    },

    /// Replay stopped after `restored` of `total` lines.
    Partial {
        /// Lines added back before the failure.
        restored: usize,
        /// Lines that were cleared.
        total: usize,
    },

    /// An undo is already replaying.
    InProgress,

    /// There is no cleared cart to bring back.
    NothingToUndo,
}

/// Resets the replay flag however the replay ends.
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Clears the cart and replays it back on request.
#[derive(Clone)]
pub struct ClearCartUndo {
    api: Arc<dyn CartApi>,
    store: CartStore,
    reconciler: Reconciler,
    notifier: Arc<dyn Notifier>,
    cleared: Arc<Mutex<Option<Vec<CartLineItem>>>>,
    replaying: Arc<AtomicBool>,
}

impl Debug for ClearCartUndo {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ClearCartUndo")
            .field("store", &self.store)
            .field("can_undo", &self.can_undo())
            .field("replaying", &self.replaying.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ClearCartUndo {
    /// A manager with nothing cleared yet.
    #[must_use]
    pub fn new(
        api: Arc<dyn CartApi>,
        store: CartStore,
        reconciler: Reconciler,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            api,
            store,
            reconciler,
            notifier,
            cleared: Arc::default(),
            replaying: Arc::default(),
        }
    }

    fn take_cleared(&self) -> Option<Vec<CartLineItem>> {
        self.cleared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn keep_cleared(&self, items: Vec<CartLineItem>) {
        *self.cleared.lock().unwrap_or_else(PoisonError::into_inner) = Some(items);
    }

    /// Whether a cleared cart is waiting to be restored.
    pub fn can_undo(&self) -> bool {
        self.cleared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Empty the cart remotely, then locally.
    ///
    /// The lines shown when the request was issued are kept for [`undo`].
    /// The store is only emptied once the request succeeds, so a failure
    /// leaves it holding whatever it holds by then, including edits made
    /// while the request was in flight.
    ///
    /// [`undo`]: Self::undo
    #[instrument(skip(self))]
    pub async fn clear(&self) -> ClearOutcome {
        let before = self.store.snapshot();

        match self.api.clear_cart().await {
            Ok(()) => {
                info!(lines = before.len(), "cart cleared");

                self.store.clear();
                self.keep_cleared(before.items().to_vec());
                self.notifier.notify(Notice::CartCleared);

                ClearOutcome::Cleared
            }
            Err(error) => {
                warn!(%error, "clearing cart failed, keeping lines");

                self.notifier.notify(Notice::ClearFailed);

                ClearOutcome::Failed
            }
        }
    }

    /// Add every cleared line back, one request at a time, then replace the
    /// store with the remote cart.
    ///
    /// Calling again while a replay is running does nothing.
    #[instrument(skip(self))]
    pub async fn undo(&self) -> UndoOutcome {
        if self
            .replaying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("undo already in progress");
            return UndoOutcome::InProgress;
        }

        let _guard = ReplayGuard(&self.replaying);

        let Some(items) = self.take_cleared() else {
            return UndoOutcome::NothingToUndo;
        };

        let total = items.len();
        let mut restored = 0;

        for item in &items {
            match self.api.add_item(item.to_new_item()).await {
                Ok(_) => restored += 1,
                Err(error) => {
                    warn!(item = %item.id, %error, restored, total, "replay stopped");
                    break;
                }
            }
        }

        if let Err(error) = self.reconciler.reload().await {
            warn!(%error, "reload after replay failed, showing replayed lines");

            self.store
                .set_items(items.into_iter().take(restored).collect());
        }

        if restored == total {
            info!(lines = total, "cleared cart restored");
            self.notifier.notify(Notice::CartRestored);

            UndoOutcome::Restored { lines: total }
        } else {
            self.notifier
                .notify(Notice::RestorePartial { restored, total });

            UndoOutcome::Partial { restored, total }
        }
    }
}

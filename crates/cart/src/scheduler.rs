//! Deferred removal scheduler.
//!
//! A removal is applied to the local store straight away, but its remote
//! commit waits out a grace window during which the shopper can undo it. At
//! most one pending mutation exists per [`MutationKey`]; scheduling again under
//! the same key cancels and replaces the earlier one.
//!
//! Cancellation only ever prevents a commit. Once the timer has fired and the
//! commit has been claimed, it runs to completion and, if it fails, its
//! restore action runs exactly once.

use std::{
    fmt::Display,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use jiff::{SignedDuration, Timestamp};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tokio::{
    sync::{Notify, watch},
    task::AbortHandle,
};
use tracing::{debug, info, warn};

use crate::{models::CartItemUuid, uuids::TypedUuid};

/// Batch UUID
pub type BatchUuid = TypedUuid<Batch>;

/// Marker for batch identifiers.
#[derive(Debug)]
pub enum Batch {}

/// Line items covered by one pending mutation.
pub type Members = SmallVec<[CartItemUuid; 4]>;

/// Key under which at most one mutation may be pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKey {
    /// A single line.
    Item(CartItemUuid),
    /// Lines removed together.
    Batch(BatchUuid),
}

/// Lifecycle of a pending mutation.
///
/// `Scheduled` moves to exactly one of `Committed`, `Cancelled` or `Restored`,
/// passing through `Committing` while the remote call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Waiting out the grace window.
    Scheduled,
    /// The remote call is in flight.
    Committing,
    /// The remote call succeeded.
    Committed,
    /// Undone before the commit started.
    Cancelled,
    /// The commit failed and the restore action ran.
    Restored,
}

impl MutationState {
    /// Whether the mutation has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Cancelled | Self::Restored)
    }
}

/// A pending mutation as seen from outside the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    /// Key the mutation is scheduled under.
    pub key: MutationKey,
    /// Lines the mutation covers.
    pub members: Members,
    /// When the commit fires.
    pub deadline: Timestamp,
}

struct Entry {
    generation: u64,
    members: Members,
    deadline: Timestamp,
    state: Arc<watch::Sender<MutationState>>,
    trigger: Arc<Notify>,
    task: AbortHandle,
}

impl Entry {
    fn cancel(self) -> Members {
        self.task.abort();
        self.state.send_replace(MutationState::Cancelled);

        self.members
    }
}

#[derive(Default)]
struct Registry {
    next_generation: u64,
    entries: FxHashMap<MutationKey, Entry>,
    /// Members of claimed mutations whose commit has not settled, by generation.
    committing: FxHashMap<u64, Members>,
}

impl Registry {
    /// Take ownership of the entry for `key` if it is still the one scheduled
    /// as `generation`.
    fn claim(&mut self, key: MutationKey, generation: u64) -> Option<Entry> {
        if self
            .entries
            .get(&key)
            .is_some_and(|entry| entry.generation == generation)
        {
            return self.entries.remove(&key);
        }

        None
    }

    /// Claim the entry for committing. Its members stay listed as committing
    /// until [`settle`](Self::settle).
    fn begin_commit(&mut self, key: MutationKey, generation: u64) -> bool {
        let Some(entry) = self.claim(key, generation) else {
            return false;
        };

        self.committing.insert(generation, entry.members);

        true
    }

    fn settle(&mut self, generation: u64) {
        self.committing.remove(&generation);
    }
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one scheduled mutation.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    key: MutationKey,
    generation: u64,
    deadline: Timestamp,
    state: watch::Receiver<MutationState>,
    registry: SharedRegistry,
}

impl PendingMutation {
    /// Key the mutation was scheduled under.
    pub fn key(&self) -> MutationKey {
        self.key
    }

    /// Wall-clock time at which the commit fires unless cancelled.
    pub fn deadline(&self) -> Timestamp {
        self.deadline
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MutationState {
        *self.state.borrow()
    }

    /// Cancel this mutation if it has not started committing. A handle whose
    /// mutation has been replaced cannot cancel the replacement.
    pub fn cancel(&self) -> bool {
        let entry = lock(&self.registry).claim(self.key, self.generation);

        entry.map(Entry::cancel).is_some()
    }

    /// Wait until the mutation reaches a terminal state.
    pub async fn finished(&self) -> MutationState {
        let mut state = self.state.clone();

        let settled = state
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state);

        settled.unwrap_or_else(|_| *self.state.borrow())
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("generation", &self.generation)
            .field("members", &self.members)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("next_generation", &self.next_generation)
            .field("entries", &self.entries)
            .finish()
    }
}

/// Owner of every pending deferred mutation.
#[derive(Debug, Clone)]
pub struct DeleteScheduler {
    grace: Duration,
    registry: SharedRegistry,
}

impl DeleteScheduler {
    /// A scheduler whose mutations commit `grace` after being scheduled.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            registry: SharedRegistry::default(),
        }
    }

    /// The grace window applied to every mutation.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Defer removal of a single line. See [`schedule`](Self::schedule).
    pub fn schedule_delete<F, R, RF, E>(
        &self,
        item: CartItemUuid,
        commit: F,
        restore: R,
    ) -> PendingMutation
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        R: FnOnce(E) -> RF + Send + 'static,
        RF: Future<Output = ()> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.schedule(MutationKey::Item(item), [item], commit, restore)
    }

    /// Run `commit` once the grace window elapses, unless cancelled first.
    ///
    /// `commit` is not polled before then. If it fails, `restore` receives the
    /// error and its future is awaited before the mutation counts as settled.
    /// Any mutation already pending under `key` is cancelled and replaced.
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F, R, RF, E>(
        &self,
        key: MutationKey,
        members: impl IntoIterator<Item = CartItemUuid>,
        commit: F,
        restore: R,
    ) -> PendingMutation
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        R: FnOnce(E) -> RF + Send + 'static,
        RF: Future<Output = ()> + Send + 'static,
        E: Display + Send + 'static,
    {
        let members = members.into_iter().collect::<Members>();
        let deadline = deadline_after(self.grace);
        let (sender, receiver) = watch::channel(MutationState::Scheduled);
        let state = Arc::new(sender);
        let trigger = Arc::new(Notify::new());

        let mut registry = lock(&self.registry);

        registry.next_generation += 1;
        let generation = registry.next_generation;

        let task = tokio::spawn(run_mutation(
            Arc::clone(&self.registry),
            key,
            generation,
            self.grace,
            Arc::clone(&trigger),
            Arc::clone(&state),
            commit,
            restore,
        ))
        .abort_handle();

        let replaced = registry.entries.insert(
            key,
            Entry {
                generation,
                members,
                deadline,
                state,
                trigger,
                task,
            },
        );

        drop(registry);

        if let Some(previous) = replaced {
            debug!(?key, generation = previous.generation, "replaced pending mutation");
            previous.cancel();
        }

        debug!(?key, generation, %deadline, "scheduled mutation");

        PendingMutation {
            key,
            generation,
            deadline,
            state: receiver,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Cancel the mutation pending under `key`, returning the lines it covered.
    /// Returns `None` when nothing is pending or the commit has already started.
    pub fn cancel(&self, key: MutationKey) -> Option<Members> {
        let entry = lock(&self.registry).entries.remove(&key)?;

        info!(?key, "cancelled pending mutation");

        Some(entry.cancel())
    }

    /// Cancel every mutation whose members include any of `items`.
    pub fn cancel_many(&self, items: &[CartItemUuid]) -> Vec<(MutationKey, Members)> {
        let cancelled = {
            let mut registry = lock(&self.registry);

            let keys = registry
                .entries
                .iter()
                .filter(|(_, entry)| entry.members.iter().any(|member| items.contains(member)))
                .map(|(key, _)| *key)
                .collect::<Vec<_>>();

            keys.into_iter()
                .filter_map(|key| registry.entries.remove(&key).map(|entry| (key, entry)))
                .collect::<Vec<_>>()
        };

        cancelled
            .into_iter()
            .map(|(key, entry)| {
                info!(?key, "cancelled pending mutation");
                (key, entry.cancel())
            })
            .collect()
    }

    /// Cancel everything pending, returning the lines that were covered.
    pub fn cancel_all(&self) -> Vec<CartItemUuid> {
        let entries = std::mem::take(&mut lock(&self.registry).entries);

        if !entries.is_empty() {
            info!(count = entries.len(), "cancelled all pending mutations");
        }

        entries
            .into_values()
            .flat_map(Entry::cancel)
            .collect()
    }

    /// Whether a mutation is waiting under `key`.
    pub fn is_pending(&self, key: MutationKey) -> bool {
        lock(&self.registry).entries.contains_key(&key)
    }

    /// Every mutation still inside its grace window.
    pub fn pending(&self) -> Vec<PendingSummary> {
        lock(&self.registry)
            .entries
            .iter()
            .map(|(key, entry)| PendingSummary {
                key: *key,
                members: entry.members.clone(),
                deadline: entry.deadline,
            })
            .collect()
    }

    /// Lines covered by a mutation that has not settled yet, whether it is
    /// still inside its grace window or its commit is in flight.
    pub fn unsettled_members(&self) -> FxHashSet<CartItemUuid> {
        let registry = lock(&self.registry);

        registry
            .entries
            .values()
            .flat_map(|entry| entry.members.iter().copied())
            .chain(registry.committing.values().flatten().copied())
            .collect()
    }

    /// Fire every pending mutation now and wait for all of them to settle.
    pub async fn flush(&self) {
        let waiting = lock(&self.registry)
            .entries
            .values()
            .map(|entry| (Arc::clone(&entry.trigger), entry.state.subscribe()))
            .collect::<Vec<_>>();

        if waiting.is_empty() {
            return;
        }

        info!(count = waiting.len(), "flushing pending mutations");

        join_all(waiting.into_iter().map(|(trigger, mut state)| async move {
            trigger.notify_one();

            if state.wait_for(|state| state.is_terminal()).await.is_err() {
                debug!("mutation ended without reporting a final state");
            }
        }))
        .await;
    }
}

fn deadline_after(grace: Duration) -> Timestamp {
    SignedDuration::try_from(grace)
        .ok()
        .and_then(|grace| Timestamp::now().checked_add(grace).ok())
        .unwrap_or(Timestamp::MAX)
}

#[expect(
    clippy::too_many_arguments,
    reason = "spawned task owns every piece of one mutation."
)]
async fn run_mutation<F, R, RF, E>(
    registry: SharedRegistry,
    key: MutationKey,
    generation: u64,
    grace: Duration,
    trigger: Arc<Notify>,
    state: Arc<watch::Sender<MutationState>>,
    commit: F,
    restore: R,
) where
    F: Future<Output = Result<(), E>> + Send + 'static,
    R: FnOnce(E) -> RF + Send + 'static,
    RF: Future<Output = ()> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::select! {
        () = tokio::time::sleep(grace) => {}
        () = trigger.notified() => {}
    }

    let claimed = lock(&registry).begin_commit(key, generation);

    if !claimed {
        return;
    }

    state.send_replace(MutationState::Committing);

    let result = commit.await;

    lock(&registry).settle(generation);

    match result {
        Ok(()) => {
            info!(?key, "committed pending mutation");
            state.send_replace(MutationState::Committed);
        }
        Err(error) => {
            warn!(?key, %error, "pending mutation failed, restoring");
            restore(error).await;
            state.send_replace(MutationState::Restored);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::{sync::oneshot, time::sleep};

    use super::*;

    const GRACE: Duration = Duration::from_secs(5);

    #[derive(Debug, Default, Clone)]
    struct Counters {
        commits: Arc<AtomicUsize>,
        restores: Arc<AtomicUsize>,
    }

    impl Counters {
        fn commits(&self) -> usize {
            self.commits.load(Ordering::SeqCst)
        }

        fn restores(&self) -> usize {
            self.restores.load(Ordering::SeqCst)
        }

        fn schedule(
            &self,
            scheduler: &DeleteScheduler,
            item: CartItemUuid,
            outcome: Result<(), String>,
        ) -> PendingMutation {
            let commits = Arc::clone(&self.commits);
            let restores = Arc::clone(&self.restores);

            scheduler.schedule_delete(
                item,
                async move {
                    commits.fetch_add(1, Ordering::SeqCst);
                    outcome
                },
                move |_error: String| {
                    restores.fetch_add(1, Ordering::SeqCst);
                    async {}
                },
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn undo_before_deadline_prevents_commit() {
        let scheduler = DeleteScheduler::new(GRACE);
        let counters = Counters::default();
        let item = CartItemUuid::now_v7();

        let pending = counters.schedule(&scheduler, item, Ok(()));

        sleep(GRACE - Duration::from_millis(1)).await;

        assert!(
            scheduler.cancel(MutationKey::Item(item)).is_some(),
            "cancel should win before the deadline"
        );

        sleep(GRACE * 2).await;

        assert_eq!(pending.finished().await, MutationState::Cancelled);
        assert_eq!(counters.commits(), 0);
        assert_eq!(counters.restores(), 0);
        assert!(!scheduler.is_pending(MutationKey::Item(item)));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_commits_exactly_once_and_not_early() {
        let scheduler = DeleteScheduler::new(GRACE);
        let counters = Counters::default();

        let pending = counters.schedule(&scheduler, CartItemUuid::now_v7(), Ok(()));

        sleep(GRACE - Duration::from_millis(1)).await;

        assert_eq!(counters.commits(), 0);
        assert_eq!(pending.state(), MutationState::Scheduled);

        assert_eq!(pending.finished().await, MutationState::Committed);

        sleep(GRACE * 3).await;

        assert_eq!(counters.commits(), 1);
        assert_eq!(counters.restores(), 0);
        assert!(scheduler.pending().is_empty(), "registry should be empty");
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_earlier_mutation() {
        let scheduler = DeleteScheduler::new(GRACE);
        let first = Counters::default();
        let second = Counters::default();
        let item = CartItemUuid::now_v7();

        let first_pending = first.schedule(&scheduler, item, Err("boom".to_string()));

        sleep(GRACE / 2).await;

        let second_pending = second.schedule(&scheduler, item, Ok(()));

        assert_eq!(first_pending.finished().await, MutationState::Cancelled);
        assert_eq!(second_pending.finished().await, MutationState::Committed);

        sleep(GRACE * 2).await;

        assert_eq!(first.commits(), 0);
        assert_eq!(first.restores(), 0);
        assert_eq!(second.commits(), 1);
        assert_eq!(scheduler.pending().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_restarts_the_grace_window() {
        let scheduler = DeleteScheduler::new(GRACE);
        let counters = Counters::default();
        let item = CartItemUuid::now_v7();

        counters.schedule(&scheduler, item, Ok(()));

        sleep(GRACE / 2).await;

        counters.schedule(&scheduler, item, Ok(()));

        sleep(GRACE - Duration::from_millis(1)).await;

        assert_eq!(counters.commits(), 0);

        sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;

        assert_eq!(counters.commits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_restores_exactly_once() {
        let scheduler = DeleteScheduler::new(GRACE);
        let counters = Counters::default();

        let pending =
            counters.schedule(&scheduler, CartItemUuid::now_v7(), Err("503".to_string()));

        assert_eq!(pending.finished().await, MutationState::Restored);

        sleep(GRACE * 2).await;

        assert_eq!(counters.commits(), 1);
        assert_eq!(counters.restores(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_handle_cannot_cancel_replacement() {
        let scheduler = DeleteScheduler::new(GRACE);
        let counters = Counters::default();
        let item = CartItemUuid::now_v7();

        let stale = counters.schedule(&scheduler, item, Ok(()));
        let current = counters.schedule(&scheduler, item, Ok(()));

        assert!(!stale.cancel(), "stale handle must not cancel");
        assert!(current.cancel(), "current handle should cancel");
        assert_eq!(current.finished().await, MutationState::Cancelled);
        assert_eq!(counters.commits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_commit_cannot_be_cancelled() {
        let scheduler = DeleteScheduler::new(GRACE);
        let item = CartItemUuid::now_v7();
        let (release, released) = oneshot::channel::<()>();

        let pending = scheduler.schedule_delete(
            item,
            async move {
                released.await.map_err(|error| error.to_string())
            },
            |_error: String| async {},
        );

        sleep(GRACE + Duration::from_millis(1)).await;

        assert_eq!(pending.state(), MutationState::Committing);
        assert!(
            scheduler.cancel(MutationKey::Item(item)).is_none(),
            "in-flight commit should not be cancellable"
        );
        assert!(!pending.cancel(), "handle cancel should also fail");

        assert!(release.send(()).is_ok(), "commit should still be waiting");
        assert_eq!(pending.finished().await, MutationState::Committed);
    }

    #[tokio::test(start_paused = true)]
    async fn committing_members_stay_unsettled_until_the_commit_returns() {
        let scheduler = DeleteScheduler::new(GRACE);
        let item = CartItemUuid::now_v7();
        let (release, released) = oneshot::channel::<()>();

        let pending = scheduler.schedule_delete(
            item,
            async move {
                released.await.map_err(|error| error.to_string())
            },
            |_error: String| async {},
        );

        assert!(scheduler.unsettled_members().contains(&item));

        sleep(GRACE + Duration::from_millis(1)).await;

        assert_eq!(pending.state(), MutationState::Committing);
        assert!(scheduler.pending().is_empty(), "no longer pending");
        assert!(
            scheduler.unsettled_members().contains(&item),
            "in-flight commit still covers its line"
        );

        assert!(release.send(()).is_ok(), "commit should still be waiting");
        assert_eq!(pending.finished().await, MutationState::Committed);
        assert!(scheduler.unsettled_members().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_commits_without_waiting_for_the_deadline() {
        let scheduler = DeleteScheduler::new(GRACE);
        let counters = Counters::default();

        counters.schedule(&scheduler, CartItemUuid::now_v7(), Ok(()));
        counters.schedule(&scheduler, CartItemUuid::now_v7(), Err("gone".to_string()));

        let started = tokio::time::Instant::now();

        scheduler.flush().await;

        assert!(started.elapsed() < GRACE, "flush should not wait out the grace");
        assert_eq!(counters.commits(), 2);
        assert_eq!(counters.restores(), 1);
        assert!(scheduler.pending().is_empty(), "nothing should remain pending");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_many_finds_batches_by_member() {
        let scheduler = DeleteScheduler::new(GRACE);
        let a = CartItemUuid::now_v7();
        let b = CartItemUuid::now_v7();
        let c = CartItemUuid::now_v7();
        let batch = MutationKey::Batch(BatchUuid::now_v7());

        let pending = scheduler.schedule(
            batch,
            [a, b],
            async { Ok::<(), String>(()) },
            |_: String| async {},
        );
        scheduler.schedule_delete(c, async { Ok::<(), String>(()) }, |_: String| async {});

        let cancelled = scheduler.cancel_many(&[b]);

        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled.first().map(|(key, _)| *key), Some(batch));
        assert_eq!(
            cancelled.first().map(|(_, members)| members.to_vec()),
            Some(vec![a, b])
        );
        assert_eq!(pending.finished().await, MutationState::Cancelled);
        assert!(scheduler.is_pending(MutationKey::Item(c)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_returns_every_member() {
        let scheduler = DeleteScheduler::new(GRACE);
        let counters = Counters::default();
        let a = CartItemUuid::now_v7();
        let b = CartItemUuid::now_v7();

        counters.schedule(&scheduler, a, Ok(()));
        counters.schedule(&scheduler, b, Ok(()));

        let mut cancelled = scheduler.cancel_all();
        cancelled.sort();

        let mut expected = vec![a, b];
        expected.sort();

        assert_eq!(cancelled, expected);

        sleep(GRACE * 2).await;

        assert_eq!(counters.commits(), 0);
    }

    #[test]
    fn terminal_states() {
        assert!(MutationState::Committed.is_terminal());
        assert!(MutationState::Cancelled.is_terminal());
        assert!(MutationState::Restored.is_terminal());
        assert!(!MutationState::Scheduled.is_terminal());
        assert!(!MutationState::Committing.is_terminal());
    }
}

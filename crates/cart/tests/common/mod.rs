//! In-memory stand-in for the remote cart API.
//!
//! Behaves like a real cart backend with a stock table: unknown lines are
//! 404s, quantities above stock are refused with the available figure, and
//! every call is recorded. Clears and removals can be held open on a gate to
//! observe the session while a request is in flight.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use storefront_cart::{
    CartSession,
    models::{CartItemUuid, CartLineItem, NewCartItem, ProductUuid, RemoteCart},
    notifications::{ChannelNotifier, Notice},
    remote::{CartApi, CartApiError, RemoteFailure},
};
use tokio::{
    sync::{mpsc::UnboundedReceiver, oneshot},
    task,
};

pub const GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get,
    Add(ProductUuid),
    Update(CartItemUuid, u32),
    Remove(CartItemUuid),
    Clear,
}

#[derive(Debug, Default)]
struct RemoteState {
    items: Vec<CartLineItem>,
    catalog: FxHashMap<ProductUuid, CartLineItem>,
    stock: FxHashMap<ProductUuid, u32>,
    calls: Vec<Call>,
    adds_before_failure: Option<usize>,
    adds_in_flight: usize,
    max_adds_in_flight: usize,
    next_update_failure: Option<RemoteFailure>,
    clear_gate: Option<oneshot::Receiver<Result<(), CartApiError>>>,
    remove_gate: Option<oneshot::Receiver<()>>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCartApi {
    state: Arc<Mutex<RemoteState>>,
}

impl InMemoryCartApi {
    pub fn with_items(items: Vec<CartLineItem>) -> Self {
        let api = Self::default();

        {
            let mut state = api.state();

            state.catalog = items
                .iter()
                .map(|item| (item.product_id, item.clone()))
                .collect();
            state.items = items;
        }

        api
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_stock(&self, product: ProductUuid, available: u32) {
        self.state().stock.insert(product, available);
    }

    /// Refuse every add after the first `count`.
    pub fn fail_adds_after(&self, count: usize) {
        self.state().adds_before_failure = Some(count);
    }

    /// Drop a line remotely, as another tab would.
    pub fn remove_elsewhere(&self, id: CartItemUuid) {
        self.state().items.retain(|item| item.id != id);
    }

    /// Refuse the next quantity update with `failure`.
    pub fn reject_next_update(&self, failure: RemoteFailure) {
        self.state().next_update_failure = Some(failure);
    }

    /// Hold the next clear until the returned sender answers it.
    pub fn gate_clear(&self) -> oneshot::Sender<Result<(), CartApiError>> {
        let (sender, receiver) = oneshot::channel();

        self.state().clear_gate = Some(receiver);

        sender
    }

    /// Hold the next removal until the returned sender fires.
    pub fn gate_remove(&self) -> oneshot::Sender<()> {
        let (sender, receiver) = oneshot::channel();

        self.state().remove_gate = Some(receiver);

        sender
    }

    pub fn items(&self) -> Vec<CartLineItem> {
        self.state().items.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn max_adds_in_flight(&self) -> usize {
        self.state().max_adds_in_flight
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

fn rejected(failure: RemoteFailure) -> CartApiError {
    CartApiError::Rejected(failure)
}

#[async_trait]
impl CartApi for InMemoryCartApi {
    async fn get_current_cart(&self) -> Result<RemoteCart, CartApiError> {
        self.record(Call::Get);

        Ok(RemoteCart {
            items: self.items(),
        })
    }

    async fn add_item(&self, item: NewCartItem) -> Result<CartLineItem, CartApiError> {
        self.record(Call::Add(item.product_id));

        {
            let mut state = self.state();

            state.adds_in_flight += 1;
            state.max_adds_in_flight = state.max_adds_in_flight.max(state.adds_in_flight);
        }

        task::yield_now().await;

        let mut state = self.state();

        state.adds_in_flight -= 1;

        if let Some(remaining) = state.adds_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(rejected(RemoteFailure::with_status(503)));
            }

            *remaining -= 1;
        }

        let Some(template) = state.catalog.get(&item.product_id).cloned() else {
            return Err(rejected(RemoteFailure::with_status(404)));
        };

        let line = CartLineItem {
            id: CartItemUuid::now_v7(),
            quantity: item.quantity,
            color: item.color,
            storage: item.storage,
            ..template
        };

        state.items.push(line.clone());

        Ok(line)
    }

    async fn update_item_quantity(
        &self,
        id: CartItemUuid,
        quantity: u32,
    ) -> Result<Option<CartLineItem>, CartApiError> {
        self.record(Call::Update(id, quantity));

        let mut state = self.state();

        if let Some(failure) = state.next_update_failure.take() {
            return Err(rejected(failure));
        }

        let Some(position) = state.items.iter().position(|item| item.id == id) else {
            return Err(rejected(RemoteFailure::with_message("Cart item not found")));
        };

        let product = state.items.get(position).map(|item| item.product_id);
        let available = product.and_then(|product| state.stock.get(&product).copied());

        if let Some(available) = available.filter(|available| *available < quantity) {
            return Err(rejected(RemoteFailure {
                status: Some(400),
                message: Some("Insufficient stock".to_string()),
                available_stock: Some(available),
            }));
        }

        let line = state.items.get_mut(position).map(|item| {
            item.quantity = quantity;
            item.clone()
        });

        Ok(line)
    }

    async fn remove_item(&self, id: CartItemUuid) -> Result<(), CartApiError> {
        self.record(Call::Remove(id));

        let gate = self.state().remove_gate.take();

        if let Some(gate) = gate {
            gate.await.unwrap_or_default();
        }

        let mut state = self.state();
        let before = state.items.len();

        state.items.retain(|item| item.id != id);

        if state.items.len() == before {
            return Err(rejected(RemoteFailure::with_status(404)));
        }

        Ok(())
    }

    async fn clear_cart(&self) -> Result<(), CartApiError> {
        self.record(Call::Clear);

        let gate = self.state().clear_gate.take();

        if let Some(gate) = gate {
            gate.await.unwrap_or(Ok(()))?;
        }

        self.state().items.clear();

        Ok(())
    }
}

pub fn line(name: &str, quantity: u32, unit_price: u64) -> CartLineItem {
    CartLineItem {
        id: CartItemUuid::now_v7(),
        product_id: ProductUuid::now_v7(),
        product_name: name.to_string(),
        product_image: None,
        quantity,
        unit_price,
        applied_price: None,
        color: None,
        storage: None,
    }
}

/// A session over `api`, loaded with the remote cart.
pub fn loaded_session(api: &InMemoryCartApi) -> (CartSession, UnboundedReceiver<Notice>) {
    let (notifier, notices) = ChannelNotifier::new();
    let session = CartSession::new(Arc::new(api.clone()), Arc::new(notifier), GRACE);

    session.store().set_items(api.items());

    (session, notices)
}

pub fn drain(receiver: &mut UnboundedReceiver<Notice>) -> Vec<Notice> {
    let mut notices = Vec::new();

    while let Ok(notice) = receiver.try_recv() {
        notices.push(notice);
    }

    notices
}

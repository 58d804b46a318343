//! Shared helpers for unit tests.

use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    models::{CartItemUuid, CartLineItem, ProductUuid},
    notifications::Notice,
};

pub(crate) fn line(name: &str, quantity: u32, unit_price: u64) -> CartLineItem {
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

/// Everything sent so far, without waiting for more.
pub(crate) fn drain(receiver: &mut UnboundedReceiver<Notice>) -> Vec<Notice> {
    let mut notices = Vec::new();

    while let Ok(notice) = receiver.try_recv() {
        notices.push(notice);
    }

    notices
}

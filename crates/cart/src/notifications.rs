//! User-facing notices.
//!
//! Every correction and every failure ends in exactly one [`Notice`], phrased
//! as an outcome the shopper can act on rather than an error code.

use std::fmt::{Display, Formatter, Result as FmtResult};

use mockall::automock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome reported to the shopper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A line was removed and can be brought back during the grace window.
    ItemRemoved {
        /// Product name of the line.
        name: String,
    },

    /// Several lines were removed in one action.
    ItemsRemoved {
        /// Lines removed.
        count: usize,
    },

    /// Removed lines were put back after an undo.
    ItemsRestored {
        /// Lines put back.
        count: usize,
    },

    /// The line no longer exists remotely and was dropped.
    ItemDropped {
        /// Product name of the line.
        name: String,
    },

    /// The line was removed because it is out of stock.
    OutOfStock {
        /// Product name of the line.
        name: String,
    },

    /// The line's quantity was lowered to what is in stock.
    QuantityReduced {
        /// Product name of the line.
        name: String,
        /// The quantity now held.
        quantity: u32,
    },

    /// The cart was replaced with the remote copy after a conflict.
    CartReloaded,

    /// A quantity change could not be saved and was reverted.
    UpdateFailed {
        /// Product name of the line.
        name: String,
    },

    /// A removal could not be saved and the line is back in the cart.
    RemoveFailed {
        /// Product name of the line.
        name: String,
    },

    /// The cart was emptied and can be restored.
    CartCleared,

    /// The cart could not be emptied.
    ClearFailed,

    /// A cleared cart was restored.
    CartRestored,

    /// Some lines of a cleared cart could not be restored.
    RestorePartial {
        /// Lines added back.
        restored: usize,
        /// Lines that were cleared.
        total: usize,
    },
}

impl Notice {
    /// Whether the interface should offer an undo affordance with this notice.
    pub fn offers_undo(&self) -> bool {
        matches!(
            self,
            Self::ItemRemoved { .. } | Self::ItemsRemoved { .. } | Self::CartCleared
        )
    }
}

impl Display for Notice {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::ItemRemoved { name } => write!(f, "{name} removed from your cart"),
            Self::ItemsRemoved { count } => write!(f, "{count} items removed from your cart"),
            Self::ItemsRestored { count: 1 } => write!(f, "Item restored to your cart"),
            Self::ItemsRestored { count } => write!(f, "{count} items restored to your cart"),
            Self::ItemDropped { name } => {
                write!(f, "{name} is no longer available and was removed")
            }
            Self::OutOfStock { name } => write!(f, "{name} removed (out of stock)"),
            Self::QuantityReduced { name, quantity } => {
                write!(f, "{name} quantity reduced to {quantity}")
            }
            Self::CartReloaded => write!(f, "Cart reloaded due to a conflict"),
            Self::UpdateFailed { name } => {
                write!(f, "Couldn't update {name}, quantity restored")
            }
            Self::RemoveFailed { name } => {
                write!(f, "Couldn't remove {name}, it's back in your cart")
            }
            Self::CartCleared => write!(f, "Cart cleared"),
            Self::ClearFailed => write!(f, "Couldn't clear your cart"),
            Self::CartRestored => write!(f, "Cart restored"),
            Self::RestorePartial { restored, total } => {
                write!(f, "Restored {restored} of {total} items to your cart")
            }
        }
    }
}

/// Sink for notices; implemented by the interface layer.
#[automock]
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes every notice to the log. Useful headless and as a default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice {
            Notice::ItemDropped { .. }
            | Notice::OutOfStock { .. }
            | Notice::QuantityReduced { .. }
            | Notice::CartReloaded
            | Notice::UpdateFailed { .. }
            | Notice::RemoveFailed { .. }
            | Notice::ClearFailed
            | Notice::RestorePartial { .. } => warn!(%notice, "cart notice"),
            _ => info!(%notice, "cart notice"),
        }
    }
}

/// Forwards notices over a channel to whatever renders them.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end the interface drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (sender, receiver) = mpsc::unbounded_channel();

        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        if let Err(error) = self.sender.send(notice) {
            debug!(notice = %error.0, "notice receiver dropped");
        }
    }
}

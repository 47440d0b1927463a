//! Local view of the single working order
//!
//! The strategy never works more than one order at a time, so the ledger is
//! a single slot kept in sync with the exchange: stream pushes update it,
//! and a periodic open-orders pull reconciles drift. The exchange's view
//! always wins; the ledger's job is to notice disagreement and say what to
//! cancel.

use tracing::warn;

use crate::bybit::models::{loose_f64, OrderData, OrderStatus, Side};
use crate::error::SessionFault;

/// A live order as the ledger tracks it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutstandingOrder {
    pub id: String,
    pub side: Side,
    pub qty: f64,
    pub leaves_qty: f64,
    pub cum_exec_qty: f64,
    pub price: f64,
    pub status: OrderStatus,
}

impl From<&OrderData> for OutstandingOrder {
    fn from(order: &OrderData) -> Self {
        OutstandingOrder {
            id: order.order_id.clone(),
            side: order.side,
            qty: loose_f64(&order.qty),
            leaves_qty: loose_f64(&order.leaves_qty),
            cum_exec_qty: loose_f64(&order.cum_exec_qty),
            price: loose_f64(&order.price),
            status: order.order_status,
        }
    }
}

/// What the caller must do after a reconciliation pull.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    None,
    /// More than one live order exists; cancel everything and start over.
    CancelAll,
}

/// Single-slot order tracker.
#[derive(Debug, Default)]
pub struct OrderLedger {
    tracked: Option<OutstandingOrder>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked(&self) -> Option<&OutstandingOrder> {
        self.tracked.as_ref()
    }

    /// Track `order`, adopting it over whatever was tracked before. Returns
    /// the id of a conflicting previous order, which the caller must cancel.
    pub fn store(&mut self, order: OutstandingOrder) -> Option<String> {
        let conflict = match &self.tracked {
            Some(prev) if prev.id != order.id => {
                let fault = SessionFault::OrderConflict {
                    tracked: prev.id.clone(),
                    incoming: order.id.clone(),
                };
                warn!("{fault}, cancelling the tracked one");
                Some(prev.id.clone())
            }
            _ => None,
        };
        self.tracked = Some(order);
        conflict
    }

    /// Stop tracking `id` if it is the tracked order.
    pub fn remove(&mut self, id: &str) {
        if self.tracked.as_ref().is_some_and(|o| o.id == id) {
            self.tracked = None;
        }
    }

    /// Apply one order-stream update. Live statuses (re)track the order;
    /// terminal statuses release the slot. Returns the id of a conflicting
    /// order to cancel, as in [`store`](Self::store).
    pub fn apply(&mut self, order: &OrderData) -> Option<String> {
        if order.order_status.is_live() {
            self.store(OutstandingOrder::from(order))
        } else {
            self.remove(&order.order_id);
            None
        }
    }

    /// Reconcile against a full open-orders pull. Zero orders releases the
    /// slot; exactly one becomes the tracked order; more than one is drift
    /// the caller must resolve by cancelling everything.
    pub fn reconcile(&mut self, open_orders: Vec<OutstandingOrder>) -> ReconcileAction {
        match open_orders.len() {
            0 => {
                if self.tracked.take().is_some() {
                    warn!("reconciliation found no live orders, releasing tracked slot");
                }
                ReconcileAction::None
            }
            1 => {
                let order = open_orders.into_iter().next().unwrap();
                if self.tracked.as_ref().map(|o| o.id.as_str()) != Some(order.id.as_str()) {
                    warn!("reconciliation adopted order {} from the exchange", order.id);
                }
                self.tracked = Some(order);
                ReconcileAction::None
            }
            n => {
                warn!("{}, cancelling all", SessionFault::ReconciliationDrift { count: n });
                self.tracked = None;
                ReconcileAction::CancelAll
            }
        }
    }
}

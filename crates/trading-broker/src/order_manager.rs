//! Order table and position book.
//!
//! The order manager is the only writer of orders and positions. It is
//! synchronous and performs no I/O: the caller hands it broker events and
//! submission results, and sends whatever broker requests it returns.
//!
//! Every operation either applies completely or returns an error with the
//! table untouched.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};
use trading_core::error::OrderError;
use trading_core::types::{
    BrokerEvent, BrokerEventKind, BrokerOrder, Fill, Order, OrderPurpose, OrderRequest,
    OrderStatus, Position,
};
use uuid::Uuid;

/// A fill that changed a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedFill {
    pub fill: Fill,
    /// Position after the fill
    pub position: Position,
    /// P&L realized by this fill
    pub realized_pnl: Decimal,
}

/// Outcome of applying a broker event.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderUpdate {
    /// The order changed.
    Applied {
        order: Order,
        previous: OrderStatus,
        fill: Option<AppliedFill>,
    },
    /// A fill sequence number that was already applied.
    Duplicate { client_order_id: Uuid, seq: u64 },
    /// Nothing to do, e.g. an event for an order already terminal.
    Ignored { client_order_id: Uuid, reason: String },
}

impl OrderUpdate {
    /// The order after the update, if it changed.
    pub fn order(&self) -> Option<&Order> {
        match self {
            OrderUpdate::Applied { order, .. } => Some(order),
            _ => None,
        }
    }
}

/// What the caller must do to cancel an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelAction {
    /// Send a cancel request for this broker order id.
    Send { broker_order_id: String },
    /// Not yet acknowledged; cancel once the broker id is known.
    Deferred,
    /// A cancel was already sent.
    AlreadyRequested,
    /// The order is already terminal.
    AlreadyTerminal,
}

/// Differences found while resynchronizing with the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// `(client_order_id, local, broker)` for orders whose status changed
    pub status_changes: Vec<(Uuid, OrderStatus, OrderStatus)>,
    /// Working broker orders that were unknown locally
    pub adopted: Vec<Uuid>,
    /// Acknowledged orders the broker no longer knows, now cancelled
    pub vanished: Vec<Uuid>,
    /// `(symbol, local, broker)` net quantities that disagreed
    pub position_changes: Vec<(String, Decimal, Decimal)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.status_changes.is_empty()
            && self.adopted.is_empty()
            && self.vanished.is_empty()
            && self.position_changes.is_empty()
    }
}

/// Owns orders from submission to a bounded archive, and the positions
/// their fills produce.
#[derive(Debug)]
pub struct OrderManager {
    active: HashMap<Uuid, Order>,
    archive: VecDeque<Order>,
    archive_limit: usize,
    positions: HashMap<String, Position>,
}

impl OrderManager {
    /// Create an order manager keeping up to `archive_limit` terminal orders.
    pub fn new(archive_limit: usize) -> Self {
        Self {
            active: HashMap::new(),
            archive: VecDeque::new(),
            archive_limit,
            positions: HashMap::new(),
        }
    }

    /// Record a new order in `Pending`.
    pub fn submit(
        &mut self,
        request: OrderRequest,
        purpose: OrderPurpose,
        now: DateTime<Utc>,
    ) -> Result<Uuid, OrderError> {
        if request.quantity <= Decimal::ZERO {
            return Err(OrderError::InvalidQuantity(request.quantity));
        }
        let order = Order::from_request(&request, purpose, now);
        let id = order.client_order_id;
        info!(
            order_id = %id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            purpose = ?purpose,
            "Order submitted"
        );
        self.active.insert(id, order);
        Ok(id)
    }

    /// Record the broker order id returned by a successful submission.
    pub fn acknowledge(
        &mut self,
        client_order_id: Uuid,
        broker_order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OrderUpdate, OrderError> {
        self.on_broker_event(
            &BrokerEvent {
                client_order_id,
                broker_order_id: broker_order_id.to_string(),
                kind: BrokerEventKind::Acknowledged,
                timestamp: now.timestamp_millis(),
            },
            now,
        )
    }

    /// Apply an order-status event from the broker.
    pub fn on_broker_event(
        &mut self,
        event: &BrokerEvent,
        now: DateTime<Utc>,
    ) -> Result<OrderUpdate, OrderError> {
        let id = event.client_order_id;
        let Some(order) = self.active.get(&id) else {
            if self.archive.iter().any(|o| o.client_order_id == id) {
                debug!(order_id = %id, kind = ?event.kind, "Event for terminal order ignored");
                return Ok(OrderUpdate::Ignored {
                    client_order_id: id,
                    reason: "order already terminal".into(),
                });
            }
            return Err(OrderError::UnknownOrder(id));
        };

        let previous = order.status;
        let known_broker_id = order.broker_order_id.clone();
        let mut updated = order.clone();
        if updated.broker_order_id.is_none() && !event.broker_order_id.is_empty() {
            updated.broker_order_id = Some(event.broker_order_id.clone());
        }

        let mut applied_fill = None;

        match &event.kind {
            BrokerEventKind::Acknowledged => {
                if previous != OrderStatus::Pending {
                    if updated.broker_order_id != known_broker_id {
                        updated.updated_at = now;
                        self.active.insert(id, updated.clone());
                    }
                    return Ok(OrderUpdate::Ignored {
                        client_order_id: id,
                        reason: format!("already {}", previous),
                    });
                }
                updated.status = OrderStatus::Acked;
                updated.updated_at = now;
            }
            BrokerEventKind::Fill {
                seq,
                quantity,
                price,
            } => {
                if updated.has_applied_fill(*seq) {
                    debug!(order_id = %id, seq, "Duplicate fill ignored");
                    return Ok(OrderUpdate::Duplicate {
                        client_order_id: id,
                        seq: *seq,
                    });
                }
                if *quantity <= Decimal::ZERO {
                    return Err(OrderError::InvalidQuantity(*quantity));
                }
                if updated.filled_quantity + *quantity > updated.quantity {
                    return Err(OrderError::Overfill {
                        client_order_id: id,
                        quantity: updated.quantity,
                        filled: updated.filled_quantity,
                        attempted: *quantity,
                    });
                }
                match updated.last_fill_seq {
                    Some(last) if *seq < last => {
                        info!(order_id = %id, seq, last, "Late fill applied");
                    }
                    last => {
                        let expected = last.map_or(1, |last| last + 1);
                        if *seq > expected {
                            warn!(order_id = %id, seq, expected, "Fill sequence gap");
                        }
                    }
                }

                let fill = Fill {
                    seq: *seq,
                    quantity: *quantity,
                    price: *price,
                    timestamp: event.timestamp,
                };
                updated.record_fill(&fill, now);

                let mut position = self
                    .positions
                    .get(&updated.symbol)
                    .cloned()
                    .unwrap_or_else(|| Position::flat(&updated.symbol));
                let realized_pnl = position.apply_fill(updated.side, *quantity, *price);

                applied_fill = Some(AppliedFill {
                    fill,
                    position,
                    realized_pnl,
                });
            }
            BrokerEventKind::Rejected { reason } => {
                updated.status = OrderStatus::Rejected;
                updated.reject_reason = Some(reason.clone());
                updated.updated_at = now;
            }
            BrokerEventKind::Cancelled => {
                updated.status = OrderStatus::Cancelled;
                updated.updated_at = now;
            }
        }

        if updated.status != previous && !previous.can_transition_to(updated.status) {
            return Err(OrderError::InvalidTransition {
                client_order_id: id,
                from: previous,
                to: updated.status,
            });
        }

        if let Some(applied) = &applied_fill {
            self.positions
                .insert(updated.symbol.clone(), applied.position.clone());
        }

        info!(
            order_id = %id,
            symbol = %updated.symbol,
            from = %previous,
            to = %updated.status,
            filled = %updated.filled_quantity,
            "Order updated"
        );

        self.store(updated.clone());
        Ok(OrderUpdate::Applied {
            order: updated,
            previous,
            fill: applied_fill,
        })
    }

    /// Mark a locally pending order as rejected by the broker at submission.
    pub fn reject(
        &mut self,
        client_order_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<OrderUpdate, OrderError> {
        self.on_broker_event(
            &BrokerEvent {
                client_order_id,
                broker_order_id: String::new(),
                kind: BrokerEventKind::Rejected {
                    reason: reason.to_string(),
                },
                timestamp: now.timestamp_millis(),
            },
            now,
        )
    }

    /// Give up on an order whose submission retries were exhausted.
    ///
    /// Only an order that is still `Pending` changes; if the broker
    /// acknowledged it in the meantime the broker's view wins.
    pub fn mark_submission_failed(
        &mut self,
        client_order_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<OrderUpdate, OrderError> {
        match self.active.get(&client_order_id) {
            Some(order) if order.status == OrderStatus::Pending => {
                self.reject(client_order_id, &format!("submission failed: {}", reason), now)
            }
            Some(order) => Ok(OrderUpdate::Ignored {
                client_order_id,
                reason: format!("already {}", order.status),
            }),
            None => self.on_broker_event(
                &BrokerEvent {
                    client_order_id,
                    broker_order_id: String::new(),
                    kind: BrokerEventKind::Rejected {
                        reason: reason.to_string(),
                    },
                    timestamp: now.timestamp_millis(),
                },
                now,
            ),
        }
    }

    /// Request cancellation.
    ///
    /// The order becomes `Cancelled` when the broker confirms. An order
    /// without a broker id is cancelled as soon as it is acknowledged.
    pub fn cancel(&mut self, client_order_id: Uuid) -> Result<CancelAction, OrderError> {
        let Some(order) = self.active.get_mut(&client_order_id) else {
            if self
                .archive
                .iter()
                .any(|o| o.client_order_id == client_order_id)
            {
                return Ok(CancelAction::AlreadyTerminal);
            }
            return Err(OrderError::UnknownOrder(client_order_id));
        };

        if order.cancel_requested {
            return Ok(CancelAction::AlreadyRequested);
        }
        order.cancel_requested = true;

        match &order.broker_order_id {
            Some(broker_order_id) => {
                info!(order_id = %client_order_id, broker_order_id = %broker_order_id, "Cancel requested");
                Ok(CancelAction::Send {
                    broker_order_id: broker_order_id.clone(),
                })
            }
            None => {
                info!(order_id = %client_order_id, "Cancel deferred until acknowledgement");
                Ok(CancelAction::Deferred)
            }
        }
    }

    /// Cancel locally without broker confirmation. Used when shutdown
    /// times out on unresponsive orders.
    pub fn force_cancel(&mut self, client_order_id: Uuid, now: DateTime<Utc>) -> Option<Order> {
        let mut order = self.active.remove(&client_order_id)?;
        let previous = order.status;
        order.status = OrderStatus::Cancelled;
        order.updated_at = now;
        warn!(order_id = %client_order_id, from = %previous, "Order force-cancelled");
        self.archive_order(order.clone());
        Some(order)
    }

    /// Resynchronize with the broker's view after a reconnection.
    ///
    /// The broker is authoritative: known orders take the broker's status
    /// and fill state, acknowledged orders the broker no longer lists are
    /// cancelled, working orders missing from the table are adopted, and positions are
    /// replaced. Orders never acknowledged are left alone since their
    /// submission may still be in flight.
    pub fn reconcile(
        &mut self,
        broker_orders: Vec<BrokerOrder>,
        broker_positions: Vec<Position>,
        now: DateTime<Utc>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut by_id: HashMap<Uuid, BrokerOrder> = broker_orders
            .into_iter()
            .map(|o| (o.client_order_id, o))
            .collect();

        let local_ids: Vec<Uuid> = self.active.keys().copied().collect();
        for id in local_ids {
            let Some(mut order) = self.active.remove(&id) else {
                continue;
            };

            match by_id.remove(&id) {
                Some(remote) => {
                    let previous = order.status;
                    order.broker_order_id = Some(remote.broker_order_id);
                    order.status = remote.status;
                    order.filled_quantity = remote.filled_quantity;
                    order.avg_fill_price = remote.avg_fill_price;
                    order.assume_fills_through(remote.last_fill_seq);
                    if previous != order.status {
                        warn!(order_id = %id, from = %previous, to = %order.status, "Order status corrected by broker");
                        order.updated_at = now;
                        report.status_changes.push((id, previous, order.status));
                    }
                    self.store(order);
                }
                None if order.broker_order_id.is_some() => {
                    warn!(order_id = %id, status = %order.status, "Acknowledged order unknown to broker, cancelling");
                    report
                        .status_changes
                        .push((id, order.status, OrderStatus::Cancelled));
                    report.vanished.push(id);
                    order.status = OrderStatus::Cancelled;
                    order.updated_at = now;
                    self.store(order);
                }
                None => {
                    self.active.insert(id, order);
                }
            }
        }

        for (id, remote) in by_id {
            if remote.status.is_terminal() {
                continue;
            }
            // An order given up locally (failed submission, forced cancel)
            // that the broker still works comes back with its purpose.
            let mut order = match self.archive.iter().position(|o| o.client_order_id == id) {
                Some(index) => match self.archive.remove(index) {
                    Some(order) => order,
                    None => continue,
                },
                None => {
                    let request =
                        OrderRequest::market(&remote.symbol, remote.side, remote.quantity)
                            .with_client_order_id(id);
                    Order::from_request(&request, OrderPurpose::Adopted, now)
                }
            };
            let previous = order.status;
            order.broker_order_id = Some(remote.broker_order_id);
            order.status = remote.status;
            order.filled_quantity = remote.filled_quantity;
            order.avg_fill_price = remote.avg_fill_price;
            order.assume_fills_through(remote.last_fill_seq);
            order.reject_reason = None;
            order.updated_at = now;
            warn!(order_id = %id, symbol = %order.symbol, from = %previous, status = %order.status, "Adopted broker order");
            report.adopted.push(id);
            self.active.insert(id, order);
        }

        let mut remote_positions: HashMap<String, Position> = broker_positions
            .into_iter()
            .filter(|p| !p.is_flat())
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.extend(remote_positions.keys().cloned());
        symbols.sort();
        symbols.dedup();

        for symbol in symbols {
            let local = self.positions.remove(&symbol);
            let remote = remote_positions.remove(&symbol);
            let local_qty = local.as_ref().map_or(Decimal::ZERO, |p| p.quantity);
            let remote_qty = remote.as_ref().map_or(Decimal::ZERO, |p| p.quantity);
            let realized = local.as_ref().map_or(Decimal::ZERO, |p| p.realized_pnl);

            if local_qty != remote_qty {
                warn!(symbol = %symbol, local = %local_qty, broker = %remote_qty, "Position corrected by broker");
                report
                    .position_changes
                    .push((symbol.clone(), local_qty, remote_qty));
            }

            let mut position = match (remote, local) {
                (Some(remote), _) => remote,
                (None, Some(mut local)) => {
                    local.quantity = Decimal::ZERO;
                    local.avg_entry_price = Decimal::ZERO;
                    local
                }
                (None, None) => continue,
            };
            position.realized_pnl = realized;
            self.positions.insert(symbol, position);
        }

        info!(
            status_changes = report.status_changes.len(),
            adopted = report.adopted.len(),
            vanished = report.vanished.len(),
            position_changes = report.position_changes.len(),
            "Resynchronized with broker"
        );
        report
    }

    /// Look up an order, working or archived.
    pub fn get(&self, client_order_id: Uuid) -> Option<&Order> {
        self.active.get(&client_order_id).or_else(|| {
            self.archive
                .iter()
                .find(|o| o.client_order_id == client_order_id)
        })
    }

    /// Orders that can still execute.
    pub fn working_orders(&self) -> impl Iterator<Item = &Order> {
        self.active.values()
    }

    pub fn has_working_orders(&self) -> bool {
        !self.active.is_empty()
    }

    /// Whether `symbol` has an order that can still execute.
    pub fn has_working_order(&self, symbol: &str) -> bool {
        self.active.values().any(|o| o.symbol == symbol)
    }

    /// The oldest working order for `symbol`.
    pub fn working_order_for(&self, symbol: &str) -> Option<&Order> {
        self.active
            .values()
            .filter(|o| o.symbol == symbol)
            .min_by_key(|o| o.submitted_at)
    }

    /// Current position in `symbol`, if it was ever traded.
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Snapshot of all non-flat positions.
    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Realized P&L across all instruments.
    pub fn realized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    /// Terminal orders, oldest first.
    pub fn archived(&self) -> impl Iterator<Item = &Order> {
        self.archive.iter()
    }

    fn store(&mut self, order: Order) {
        if order.status.is_terminal() {
            self.active.remove(&order.client_order_id);
            self.archive_order(order);
        } else {
            self.active.insert(order.client_order_id, order);
        }
    }

    fn archive_order(&mut self, order: Order) {
        self.archive.push_back(order);
        while self.archive.len() > self.archive_limit {
            self.archive.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use trading_core::types::Side;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn event(id: Uuid, kind: BrokerEventKind) -> BrokerEvent {
        BrokerEvent {
            client_order_id: id,
            broker_order_id: "B-1".into(),
            kind,
            timestamp: 0,
        }
    }

    fn fill(seq: u64, quantity: Decimal, price: Decimal) -> BrokerEventKind {
        BrokerEventKind::Fill {
            seq,
            quantity,
            price,
        }
    }

    fn submit(om: &mut OrderManager, side: Side, quantity: Decimal) -> Uuid {
        om.submit(
            OrderRequest::market("SPY", side, quantity),
            OrderPurpose::Entry,
            now(),
        )
        .unwrap()
    }

    #[test]
    fn test_partial_then_complete_fill() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(5));

        om.acknowledge(id, "B-1", now()).unwrap();
        assert_eq!(om.get(id).unwrap().status, OrderStatus::Acked);

        let update = om.on_broker_event(&event(id, fill(1, dec!(3), dec!(100))), now()).unwrap();
        match update {
            OrderUpdate::Applied { order, previous, fill } => {
                assert_eq!(previous, OrderStatus::Acked);
                assert_eq!(order.status, OrderStatus::PartiallyFilled);
                assert_eq!(fill.unwrap().position.quantity, dec!(3));
            }
            other => panic!("unexpected update: {:?}", other),
        }

        om.on_broker_event(&event(id, fill(2, dec!(2), dec!(101))), now()).unwrap();
        let order = om.get(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(100.4)));
        assert_eq!(om.position("SPY").unwrap().quantity, dec!(5));
        assert!(!om.has_working_order("SPY"));
        assert_eq!(om.archived().count(), 1);
    }

    #[test]
    fn test_duplicate_fill_applied_once() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(5));
        om.acknowledge(id, "B-1", now()).unwrap();

        om.on_broker_event(&event(id, fill(1, dec!(3), dec!(100))), now()).unwrap();
        let again = om.on_broker_event(&event(id, fill(1, dec!(3), dec!(100))), now()).unwrap();

        assert_eq!(again, OrderUpdate::Duplicate { client_order_id: id, seq: 1 });
        assert_eq!(om.position("SPY").unwrap().quantity, dec!(3));
        assert_eq!(om.get(id).unwrap().filled_quantity, dec!(3));
    }

    #[test]
    fn test_late_lower_seq_fill_is_applied() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(5));
        om.acknowledge(id, "B-1", now()).unwrap();

        om.on_broker_event(&event(id, fill(2, dec!(2), dec!(101))), now()).unwrap();
        assert_eq!(om.get(id).unwrap().missing_fill_seqs(), vec![1]);

        let late = om.on_broker_event(&event(id, fill(1, dec!(3), dec!(100))), now()).unwrap();
        assert!(matches!(late, OrderUpdate::Applied { fill: Some(_), .. }));

        let order = om.get(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, dec!(5));
        assert_eq!(order.last_fill_seq, Some(2));
        assert_eq!(om.position("SPY").unwrap().quantity, dec!(5));
        assert!(!om.has_working_order("SPY"));
    }

    #[test]
    fn test_reconcile_counts_broker_fills_as_applied() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(5));
        om.acknowledge(id, "B-1", now()).unwrap();
        om.on_broker_event(&event(id, fill(2, dec!(2), dec!(100))), now()).unwrap();

        let remote = BrokerOrder {
            client_order_id: id,
            broker_order_id: "B-1".into(),
            symbol: "SPY".into(),
            side: Side::Buy,
            quantity: dec!(5),
            status: OrderStatus::PartiallyFilled,
            filled_quantity: dec!(4),
            avg_fill_price: Some(dec!(100)),
            last_fill_seq: Some(2),
        };
        om.reconcile(vec![remote], vec![Position::new("SPY", dec!(4), dec!(100))], now());
        assert!(om.get(id).unwrap().missing_fill_seqs().is_empty());

        // seq 1 is already in the broker's fill state
        let again = om.on_broker_event(&event(id, fill(1, dec!(2), dec!(100))), now()).unwrap();
        assert!(matches!(again, OrderUpdate::Duplicate { seq: 1, .. }));
        assert_eq!(om.position("SPY").unwrap().quantity, dec!(4));
    }

    #[test]
    fn test_fill_on_pending_implies_ack() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Sell, dec!(2));

        om.on_broker_event(&event(id, fill(1, dec!(2), dec!(50))), now()).unwrap();
        let order = om.get(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.broker_order_id.as_deref(), Some("B-1"));
        assert_eq!(om.position("SPY").unwrap().quantity, dec!(-2));
    }

    #[test]
    fn test_overfill_rejected_without_change() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(5));
        om.on_broker_event(&event(id, fill(1, dec!(4), dec!(100))), now()).unwrap();

        let err = om
            .on_broker_event(&event(id, fill(2, dec!(2), dec!(100))), now())
            .unwrap_err();
        assert!(matches!(err, OrderError::Overfill { .. }));
        assert_eq!(om.get(id).unwrap().filled_quantity, dec!(4));
        assert_eq!(om.position("SPY").unwrap().quantity, dec!(4));
    }

    #[test]
    fn test_invalid_submit_and_unknown_order() {
        let mut om = OrderManager::new(10);
        let result = om.submit(
            OrderRequest::market("SPY", Side::Buy, dec!(0)),
            OrderPurpose::Entry,
            now(),
        );
        assert!(matches!(result, Err(OrderError::InvalidQuantity(_))));

        let unknown = Uuid::new_v4();
        assert_eq!(
            om.on_broker_event(&event(unknown, BrokerEventKind::Acknowledged), now()),
            Err(OrderError::UnknownOrder(unknown))
        );
    }

    #[test]
    fn test_rejection_is_terminal() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(5));
        om.reject(id, "insufficient margin", now()).unwrap();

        let order = om.get(id).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.reject_reason.as_deref(), Some("insufficient margin"));

        let late = om.on_broker_event(&event(id, fill(1, dec!(1), dec!(1))), now()).unwrap();
        assert!(matches!(late, OrderUpdate::Ignored { .. }));
        assert!(om.position("SPY").is_none());
    }

    #[test]
    fn test_cancel_flow() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(5));

        assert_eq!(om.cancel(id).unwrap(), CancelAction::Deferred);
        om.acknowledge(id, "B-9", now()).unwrap();
        assert!(om.get(id).unwrap().cancel_requested);

        let other = submit(&mut om, Side::Buy, dec!(1));
        om.acknowledge(other, "B-10", now()).unwrap();
        assert_eq!(
            om.cancel(other).unwrap(),
            CancelAction::Send { broker_order_id: "B-10".into() }
        );
        assert_eq!(om.cancel(other).unwrap(), CancelAction::AlreadyRequested);

        om.on_broker_event(&event(other, BrokerEventKind::Cancelled), now()).unwrap();
        assert_eq!(om.get(other).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(om.cancel(other).unwrap(), CancelAction::AlreadyTerminal);
    }

    #[test]
    fn test_force_cancel() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(5));
        om.acknowledge(id, "B-1", now()).unwrap();

        let order = om.force_cancel(id, now()).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(!om.has_working_orders());
        assert!(om.force_cancel(id, now()).is_none());
    }

    #[test]
    fn test_submission_failed_only_touches_pending() {
        let mut om = OrderManager::new(10);
        let pending = submit(&mut om, Side::Buy, dec!(5));
        let acked = submit(&mut om, Side::Sell, dec!(5));
        om.acknowledge(acked, "B-2", now()).unwrap();

        om.mark_submission_failed(pending, "timed out", now()).unwrap();
        assert_eq!(om.get(pending).unwrap().status, OrderStatus::Rejected);

        let update = om.mark_submission_failed(acked, "timed out", now()).unwrap();
        assert!(matches!(update, OrderUpdate::Ignored { .. }));
        assert_eq!(om.get(acked).unwrap().status, OrderStatus::Acked);
    }

    #[test]
    fn test_archive_is_bounded() {
        let mut om = OrderManager::new(2);
        for _ in 0..3 {
            let id = submit(&mut om, Side::Buy, dec!(1));
            om.force_cancel(id, now());
        }
        assert_eq!(om.archived().count(), 2);
    }

    #[test]
    fn test_reconcile_is_broker_authoritative() {
        let mut om = OrderManager::new(10);
        let acked = submit(&mut om, Side::Buy, dec!(5));
        om.acknowledge(acked, "B-1", now()).unwrap();
        let vanished = submit(&mut om, Side::Buy, dec!(1));
        om.acknowledge(vanished, "B-2", now()).unwrap();
        let in_flight = submit(&mut om, Side::Buy, dec!(1));

        let adopted = Uuid::new_v4();
        let broker_orders = vec![
            BrokerOrder {
                client_order_id: acked,
                broker_order_id: "B-1".into(),
                symbol: "SPY".into(),
                side: Side::Buy,
                quantity: dec!(5),
                status: OrderStatus::PartiallyFilled,
                filled_quantity: dec!(2),
                avg_fill_price: Some(dec!(100)),
                last_fill_seq: Some(1),
            },
            BrokerOrder {
                client_order_id: adopted,
                broker_order_id: "B-3".into(),
                symbol: "QQQ".into(),
                side: Side::Sell,
                quantity: dec!(3),
                status: OrderStatus::Acked,
                filled_quantity: dec!(0),
                avg_fill_price: None,
                last_fill_seq: None,
            },
        ];
        let broker_positions = vec![Position::new("SPY", dec!(2), dec!(100))];

        let report = om.reconcile(broker_orders, broker_positions, now());

        assert_eq!(om.get(acked).unwrap().status, OrderStatus::PartiallyFilled);
        assert_eq!(om.get(vanished).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(om.get(in_flight).unwrap().status, OrderStatus::Pending);
        assert_eq!(om.get(adopted).unwrap().purpose, OrderPurpose::Adopted);
        assert_eq!(report.adopted, vec![adopted]);
        assert_eq!(report.vanished, vec![vanished]);
        assert_eq!(
            report.position_changes,
            vec![("SPY".to_string(), dec!(0), dec!(2))]
        );
        assert_eq!(om.position("SPY").unwrap().quantity, dec!(2));

        // A redelivered fill the broker already counted is a duplicate
        let again = om.on_broker_event(&event(acked, fill(1, dec!(2), dec!(100))), now()).unwrap();
        assert!(matches!(again, OrderUpdate::Duplicate { .. }));
    }

    #[test]
    fn test_reconcile_revives_order_given_up_locally() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(4));
        om.mark_submission_failed(id, "timed out", now()).unwrap();
        assert_eq!(om.get(id).unwrap().status, OrderStatus::Rejected);

        let remote = BrokerOrder {
            client_order_id: id,
            broker_order_id: "B-9".into(),
            symbol: "SPY".into(),
            side: Side::Buy,
            quantity: dec!(4),
            status: OrderStatus::Acked,
            filled_quantity: dec!(0),
            avg_fill_price: None,
            last_fill_seq: None,
        };
        let report = om.reconcile(vec![remote], vec![], now());

        let order = om.get(id).unwrap();
        assert_eq!(order.status, OrderStatus::Acked);
        assert_eq!(order.purpose, OrderPurpose::Entry);
        assert!(order.reject_reason.is_none());
        assert_eq!(report.adopted, vec![id]);
        assert!(om.has_working_order("SPY"));
        assert_eq!(om.archived().count(), 0);
    }

    #[test]
    fn test_reconcile_clean_when_in_sync() {
        let mut om = OrderManager::new(10);
        let id = submit(&mut om, Side::Buy, dec!(5));
        om.acknowledge(id, "B-1", now()).unwrap();
        om.on_broker_event(&event(id, fill(1, dec!(5), dec!(10))), now()).unwrap();

        let report = om.reconcile(vec![], vec![Position::new("SPY", dec!(5), dec!(10))], now());
        assert!(report.is_clean());
    }

    proptest! {
        #[test]
        fn prop_redelivered_fills_apply_once(
            sizes in prop::collection::vec(1u32..5, 1..10),
            redeliveries in prop::collection::vec(0usize..10, 0..20),
        ) {
            let total: u32 = sizes.iter().sum();
            let mut om = OrderManager::new(10);
            let id = submit(&mut om, Side::Buy, Decimal::from(total));
            om.acknowledge(id, "B-1", now()).unwrap();

            for (i, size) in sizes.iter().enumerate() {
                let seq = i as u64 + 1;
                let applied = event(id, fill(seq, Decimal::from(*size), dec!(10)));
                om.on_broker_event(&applied, now()).unwrap();
                for r in &redeliveries {
                    if *r <= i {
                        let size = sizes[*r];
                        let again = event(id, fill(*r as u64 + 1, Decimal::from(size), dec!(10)));
                        let update = om.on_broker_event(&again, now()).unwrap();
                        let is_ignored = matches!(
                            update,
                            OrderUpdate::Duplicate { .. } | OrderUpdate::Ignored { .. }
                        );
                        prop_assert!(is_ignored);
                    }
                }
            }

            prop_assert_eq!(om.position("SPY").unwrap().quantity, Decimal::from(total));
            prop_assert_eq!(om.get(id).unwrap().status, OrderStatus::Filled);
        }

        #[test]
        fn prop_fills_in_any_order_apply_once(
            (sizes, delivery) in prop::collection::vec(1u32..5, 1..8).prop_flat_map(|sizes| {
                let seqs: Vec<u64> = (1..=sizes.len() as u64).collect();
                (Just(sizes), Just(seqs).prop_shuffle())
            }),
        ) {
            let total: u32 = sizes.iter().sum();
            let mut om = OrderManager::new(10);
            let id = submit(&mut om, Side::Buy, Decimal::from(total));
            om.acknowledge(id, "B-1", now()).unwrap();

            for seq in delivery.iter().chain(delivery.iter()) {
                let size = Decimal::from(sizes[*seq as usize - 1]);
                om.on_broker_event(&event(id, fill(*seq, size, dec!(10))), now()).unwrap();
            }

            let order = om.get(id).unwrap();
            prop_assert_eq!(order.status, OrderStatus::Filled);
            prop_assert_eq!(order.filled_quantity, Decimal::from(total));
            prop_assert_eq!(om.position("SPY").unwrap().quantity, Decimal::from(total));
        }
    }
}

// =============================================================================
// Order Monitor — conditional orders evaluated against the live price
// =============================================================================
//
// One shared evaluation loop sweeps all active orders on a fixed interval
// (a 1–3 s cadence in practice, matching typical feed latency).
// Evaluation polls a `PriceSource` rather than reacting to ticks: an order
// must be re-checked even when the price has not moved, and must not be
// re-evaluated on every one of many ticks per millisecond from a noisy feed.
//
// Exactly-once guarantee: the active-order map holds only active orders, and
// both the trigger sweep and `cancel` transition an order by *removing* it
// under the map's write lock. Whichever path removes the entry wins; the
// other observes a no-op. Trigger events are emitted only for orders the
// sweep itself removed, so a trigger fires at most once per order and never
// races a cancellation.
//
// `stop_all` cancels everything, then joins the evaluation loop before
// returning — no trigger event can be observed afterwards.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::types::TriggerEvent;

/// Default depth of the trigger event channel when not configured explicitly.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Price source abstraction
// ---------------------------------------------------------------------------

/// Where the monitor reads the live price from.
///
/// Implementations must be non-blocking — evaluation runs dozens of orders
/// per sweep, so this should be an in-memory cache (the reconciler behind its
/// staleness gate), never a direct network call. Returning `None` means the
/// price is unknown or stale; affected orders are skipped for that cycle and
/// re-evaluated on the next one.
pub trait PriceSource: Send + Sync + 'static {
    fn current_price(&self) -> Option<f64>;
}

// ---------------------------------------------------------------------------
// Order types
// ---------------------------------------------------------------------------

/// What kind of conditional order this is. The monitor itself only ever
/// evaluates the stored `condition`; the kind travels along for sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "Limit"),
            Self::StopLoss => write!(f, "StopLoss"),
            Self::TakeProfit => write!(f, "TakeProfit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// The price comparison that fires the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    /// Fires when `price <= target_price`.
    Below,
    /// Fires when `price >= target_price`.
    Above,
}

impl TriggerCondition {
    /// The conventional derivation from `(kind, side)`: a buy fills on the
    /// way down for limit/take-profit and on the way up for a stop; a sell
    /// mirrors that. Callers with other conventions construct the order with
    /// an explicit condition instead.
    pub fn derived(kind: OrderKind, side: OrderSide) -> Self {
        match (kind, side) {
            (OrderKind::Limit, OrderSide::Buy) => Self::Below,
            (OrderKind::Limit, OrderSide::Sell) => Self::Above,
            (OrderKind::StopLoss, OrderSide::Buy) => Self::Above,
            (OrderKind::StopLoss, OrderSide::Sell) => Self::Below,
            (OrderKind::TakeProfit, OrderSide::Buy) => Self::Below,
            (OrderKind::TakeProfit, OrderSide::Sell) => Self::Above,
        }
    }

    fn met(self, price: f64, target: f64) -> bool {
        match self {
            Self::Below => price <= target,
            Self::Above => price >= target,
        }
    }
}

/// Lifecycle state. Transitions are monotonic: `Active` is the only
/// non-terminal state, and a triggered or cancelled order never re-enters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Active,
    Triggered,
    Cancelled,
}

/// A conditional order held in memory by the monitor for its lifetime.
///
/// Durability across restarts is the caller's concern: snapshot these records
/// (they serialise) and re-`start` them on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredOrder {
    pub order_id: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub target_price: f64,
    pub amount: f64,
    pub condition: TriggerCondition,
    pub state: OrderState,
}

impl MonitoredOrder {
    /// Build an active order with the condition derived from `(kind, side)`.
    pub fn new(
        order_id: impl Into<String>,
        kind: OrderKind,
        side: OrderSide,
        target_price: f64,
        amount: f64,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            kind,
            side,
            target_price,
            amount,
            condition: TriggerCondition::derived(kind, side),
            state: OrderState::Active,
        }
    }

    /// Override the derived trigger condition.
    pub fn with_condition(mut self, condition: TriggerCondition) -> Self {
        self.condition = condition;
        self
    }
}

// ---------------------------------------------------------------------------
// OrderMonitor
// ---------------------------------------------------------------------------

/// Evaluates a set of conditional orders against the live price and fires
/// each at most once.
pub struct OrderMonitor {
    /// Active orders only; terminal orders are removed on transition.
    orders: Arc<RwLock<HashMap<String, MonitoredOrder>>>,
    price_source: Arc<dyn PriceSource>,
    eval_interval: Duration,
    triggers: broadcast::Sender<TriggerEvent>,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl OrderMonitor {
    pub fn new(
        price_source: Arc<dyn PriceSource>,
        eval_interval_ms: u64,
    ) -> Result<Self, EngineError> {
        Self::with_channel_capacity(price_source, eval_interval_ms, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(
        price_source: Arc<dyn PriceSource>,
        eval_interval_ms: u64,
        channel_capacity: usize,
    ) -> Result<Self, EngineError> {
        if eval_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "eval_interval_ms must be > 0".into(),
            ));
        }
        if channel_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "trigger channel capacity must be > 0".into(),
            ));
        }
        let (triggers, _) = broadcast::channel(channel_capacity);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            orders: Arc::new(RwLock::new(HashMap::new())),
            price_source,
            eval_interval: Duration::from_millis(eval_interval_ms),
            triggers,
            shutdown,
            loop_handle: Mutex::new(None),
        })
    }

    /// Subscribe to trigger events. Execution sinks (swap submission,
    /// notifications) attach here.
    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.triggers.subscribe()
    }

    /// Register an order as active. Non-blocking.
    pub fn start(&self, order: MonitoredOrder) -> Result<(), EngineError> {
        if *self.shutdown.borrow() {
            return Err(EngineError::ShutDown);
        }
        if order.order_id.is_empty() {
            return Err(EngineError::invalid_order("", "empty order id"));
        }
        if !order.target_price.is_finite() || order.target_price <= 0.0 {
            return Err(EngineError::invalid_order(
                &order.order_id,
                format!("non-positive target price {}", order.target_price),
            ));
        }
        if !order.amount.is_finite() || order.amount <= 0.0 {
            return Err(EngineError::invalid_order(
                &order.order_id,
                format!("non-positive amount {}", order.amount),
            ));
        }
        if order.state != OrderState::Active {
            return Err(EngineError::invalid_order(
                &order.order_id,
                format!("cannot start an order in state {:?}", order.state),
            ));
        }

        let mut orders = self.orders.write();
        if orders.contains_key(&order.order_id) {
            return Err(EngineError::DuplicateOrder(order.order_id));
        }

        info!(
            order_id = %order.order_id,
            kind = %order.kind,
            side = %order.side,
            target = order.target_price,
            condition = ?order.condition,
            "order registered"
        );
        orders.insert(order.order_id.clone(), order);
        Ok(())
    }

    /// Transition `active -> cancelled`. Returns `true` if this call did the
    /// transition; `false` is a no-op (unknown or already terminal), not an
    /// error. Non-blocking.
    pub fn cancel(&self, order_id: &str) -> bool {
        let removed = self.orders.write().remove(order_id);
        match removed {
            Some(mut order) => {
                order.state = OrderState::Cancelled;
                info!(order_id = %order.order_id, "order cancelled");
                true
            }
            None => {
                debug!(order_id, "cancel on unknown or terminal order — no-op");
                false
            }
        }
    }

    /// Snapshot of the active set, for dashboards or caller-side persistence.
    pub fn active_orders(&self) -> Vec<MonitoredOrder> {
        self.orders.read().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.orders.read().len()
    }

    /// Run one evaluation sweep and return the triggers it fired.
    ///
    /// This is the body of the periodic loop; it is also callable directly,
    /// which is how the tests drive deterministic interleavings. An unknown
    /// or stale price (`None`) skips the whole sweep — an order is never
    /// triggered on data the price source distrusts.
    pub fn evaluate_once(&self) -> Vec<TriggerEvent> {
        let price = match self.price_source.current_price() {
            Some(p) => p,
            None => {
                debug!("price unavailable or stale — skipping evaluation cycle");
                return Vec::new();
            }
        };

        // Collect-then-act: transition under the write lock, emit after
        // releasing it so a slow subscriber cannot extend the critical
        // section.
        let fired: Vec<TriggerEvent> = {
            let mut orders = self.orders.write();
            let ids: Vec<String> = orders
                .values()
                .filter(|o| o.condition.met(price, o.target_price))
                .map(|o| o.order_id.clone())
                .collect();

            ids.iter()
                .filter_map(|id| orders.remove(id))
                .map(|mut order| {
                    order.state = OrderState::Triggered;
                    TriggerEvent {
                        order_id: order.order_id,
                        price,
                        target_price: order.target_price,
                        kind: order.kind,
                        side: order.side,
                        amount: order.amount,
                    }
                })
                .collect()
        };

        for event in &fired {
            info!(
                order_id = %event.order_id,
                kind = %event.kind,
                side = %event.side,
                target = event.target_price,
                price = event.price,
                "ORDER TRIGGERED"
            );
            let _ = self.triggers.send(event.clone());
        }

        if fired.is_empty() {
            debug!(price, remaining = self.active_count(), "evaluation sweep: no trigger");
        }

        fired
    }

    /// Spawn the periodic evaluation loop on the current tokio runtime.
    /// Idempotent after the first call; the loop runs until [`stop_all`].
    ///
    /// [`stop_all`]: OrderMonitor::stop_all
    pub fn start_evaluation_loop(self: &Arc<Self>) {
        let mut handle_slot = self.loop_handle.lock();
        if handle_slot.is_some() {
            warn!("evaluation loop already running");
            return;
        }

        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            info!(
                interval_ms = monitor.eval_interval.as_millis() as u64,
                "order evaluation loop started"
            );
            let mut ticker = interval(monitor.eval_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.evaluate_once();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("order evaluation loop stopped");
        });
        *handle_slot = Some(handle);
    }

    /// Cancel every still-active order and halt the evaluation loop.
    ///
    /// Synchronous with respect to the trigger guarantee: the loop is joined
    /// before this returns, so no `TriggerEvent` is emitted afterwards.
    pub async fn stop_all(&self) {
        let _ = self.shutdown.send(true);

        let cancelled = {
            let mut orders = self.orders.write();
            let n = orders.len();
            orders.clear();
            n
        };
        if cancelled > 0 {
            info!(cancelled, "stop_all: cancelled remaining active orders");
        }

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Price source backed by a shared cell, settable from the test body.
    struct SharedPrice(RwLock<Option<f64>>);

    impl SharedPrice {
        fn new(initial: Option<f64>) -> Arc<Self> {
            Arc::new(Self(RwLock::new(initial)))
        }

        fn set(&self, price: Option<f64>) {
            *self.0.write() = price;
        }
    }

    impl PriceSource for SharedPrice {
        fn current_price(&self) -> Option<f64> {
            *self.0.read()
        }
    }

    fn monitor_with(price: &Arc<SharedPrice>) -> Arc<OrderMonitor> {
        let source: Arc<dyn PriceSource> = Arc::<SharedPrice>::clone(price);
        Arc::new(OrderMonitor::new(source, 100).unwrap())
    }

    fn below_order(id: &str, target: f64) -> MonitoredOrder {
        MonitoredOrder::new(id, OrderKind::Limit, OrderSide::Buy, target, 1.0)
    }

    #[test]
    fn condition_derivation_table() {
        use OrderKind::*;
        use OrderSide::*;
        assert_eq!(TriggerCondition::derived(Limit, Buy), TriggerCondition::Below);
        assert_eq!(TriggerCondition::derived(Limit, Sell), TriggerCondition::Above);
        assert_eq!(TriggerCondition::derived(StopLoss, Buy), TriggerCondition::Above);
        assert_eq!(TriggerCondition::derived(StopLoss, Sell), TriggerCondition::Below);
        assert_eq!(TriggerCondition::derived(TakeProfit, Buy), TriggerCondition::Below);
        assert_eq!(TriggerCondition::derived(TakeProfit, Sell), TriggerCondition::Above);
    }

    #[test]
    fn start_rejects_malformed_orders() {
        let price = SharedPrice::new(Some(100.0));
        let monitor = monitor_with(&price);

        assert!(monitor.start(below_order("", 100.0)).is_err());
        assert!(monitor.start(below_order("a", 0.0)).is_err());
        assert!(monitor
            .start(MonitoredOrder::new("b", OrderKind::Limit, OrderSide::Buy, 100.0, 0.0))
            .is_err());

        let mut terminal = below_order("c", 100.0);
        terminal.state = OrderState::Triggered;
        assert!(monitor.start(terminal).is_err());
        assert_eq!(monitor.active_count(), 0);
    }

    #[test]
    fn duplicate_order_id_is_rejected() {
        let price = SharedPrice::new(Some(100.0));
        let monitor = monitor_with(&price);

        monitor.start(below_order("order-1", 50.0)).unwrap();
        assert_eq!(
            monitor.start(below_order("order-1", 60.0)).err(),
            Some(EngineError::DuplicateOrder("order-1".into()))
        );
        assert_eq!(monitor.active_count(), 1);
    }

    #[test]
    fn fires_exactly_once_on_descending_sequence() {
        // Below 100 over [105, 102, 99, 95] fires once, at 99.
        let price = SharedPrice::new(None);
        let monitor = monitor_with(&price);
        let mut rx = monitor.subscribe();

        monitor.start(below_order("order-1", 100.0)).unwrap();

        let mut fired = Vec::new();
        for p in [105.0, 102.0, 99.0, 95.0] {
            price.set(Some(p));
            fired.extend(monitor.evaluate_once());
        }

        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].order_id, "order-1");
        assert_eq!(fired[0].price, 99.0);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.price, 99.0);
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.active_count(), 0);
    }

    #[test]
    fn above_condition_fires_at_or_past_target() {
        let price = SharedPrice::new(Some(99.9));
        let monitor = monitor_with(&price);

        monitor
            .start(
                MonitoredOrder::new("tp", OrderKind::TakeProfit, OrderSide::Sell, 100.0, 2.0),
            )
            .unwrap();

        assert!(monitor.evaluate_once().is_empty());

        // Boundary: p == target fires.
        price.set(Some(100.0));
        let fired = monitor.evaluate_once();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].amount, 2.0);
    }

    #[test]
    fn unknown_price_skips_the_cycle() {
        let price = SharedPrice::new(None);
        let monitor = monitor_with(&price);
        monitor.start(below_order("order-1", 100.0)).unwrap();

        assert!(monitor.evaluate_once().is_empty());
        assert_eq!(monitor.active_count(), 1);

        // The order survives to fire once the price is known again.
        price.set(Some(90.0));
        assert_eq!(monitor.evaluate_once().len(), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_terminal() {
        let price = SharedPrice::new(Some(200.0));
        let monitor = monitor_with(&price);
        monitor.start(below_order("order-1", 100.0)).unwrap();

        assert!(monitor.cancel("order-1"));
        assert!(!monitor.cancel("order-1"));
        assert!(!monitor.cancel("never-existed"));
        assert_eq!(monitor.active_count(), 0);

        // A cancelled order never fires.
        price.set(Some(50.0));
        assert!(monitor.evaluate_once().is_empty());
    }

    #[test]
    fn cancel_vs_trigger_race_is_exactly_once() {
        // Concurrent cancel and a sweep that would trigger the same order:
        // exactly one of {trigger fired, cancel succeeded}, never both.
        for _ in 0..2_000 {
            let price = SharedPrice::new(Some(50.0));
            let monitor = monitor_with(&price);
            monitor.start(below_order("r", 100.0)).unwrap();

            let m1 = Arc::clone(&monitor);
            let m2 = Arc::clone(&monitor);

            let evaluator = std::thread::spawn(move || m1.evaluate_once().len());
            let canceller = std::thread::spawn(move || m2.cancel("r"));

            let fired = evaluator.join().unwrap();
            let cancelled = canceller.join().unwrap();

            assert_eq!(
                fired == 1,
                !cancelled,
                "fired={fired} cancelled={cancelled}"
            );
            assert_eq!(monitor.active_count(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn evaluation_loop_fires_on_interval() {
        let price = SharedPrice::new(Some(105.0));
        let monitor = monitor_with(&price);
        let mut rx = monitor.subscribe();

        monitor.start(below_order("order-1", 100.0)).unwrap();
        monitor.start_evaluation_loop();

        // A few cycles above target: nothing fires.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(rx.try_recv().is_err());

        price.set(Some(99.0));
        tokio::time::sleep(Duration::from_millis(250)).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.order_id, "order-1");
        assert_eq!(event.price, 99.0);

        // Lower prices afterwards produce no further triggers.
        price.set(Some(90.0));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());

        monitor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_cancels_and_silences() {
        let price = SharedPrice::new(Some(500.0));
        let monitor = monitor_with(&price);
        let mut rx = monitor.subscribe();

        monitor.start(below_order("a", 100.0)).unwrap();
        monitor.start(below_order("b", 200.0)).unwrap();
        monitor.start_evaluation_loop();

        monitor.stop_all().await;
        assert_eq!(monitor.active_count(), 0);

        // Even a triggering price after shutdown produces nothing.
        price.set(Some(1.0));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());

        // New registrations after shutdown are refused.
        assert_eq!(
            monitor.start(below_order("c", 100.0)).err(),
            Some(EngineError::ShutDown)
        );
    }
}

//! Paper gateway: an in-process broker for dry runs and tests.
//!
//! Records every outbound call, hands out deterministic order numbers, and
//! lets a driver script the order book, order histories, forced null
//! responses, and socket events. Cloning shares the underlying state, so a
//! test can keep a handle while the engine owns the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::types::{ModifyOrder, OrderAck, OrderMsg, PlaceOrder, Session};
use super::{BrokerGateway, SocketEvent};

/// One recorded outbound broker call.
#[derive(Debug, Clone)]
pub enum GatewayCall {
    Place(PlaceOrder),
    Modify(ModifyOrder),
    Cancel(String),
    CloseBracket(String),
    Subscribe(Vec<String>),
    SubscribeOrders,
    Unsubscribe(Vec<String>),
}

#[derive(Default)]
struct PaperState {
    next_order_no: u64,
    logins: u32,
    calls: Vec<GatewayCall>,
    order_book: Option<Vec<OrderMsg>>,
    history: HashMap<String, Vec<OrderMsg>>,
    fail_places: u32,
    fail_modifies: u32,
    fail_cancels: u32,
    events_tx: Option<UnboundedSender<SocketEvent>>,
}

#[derive(Clone)]
pub struct PaperGateway {
    state: Arc<Mutex<PaperState>>,
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperGateway {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PaperState {
                next_order_no: 1000,
                order_book: Some(Vec::new()),
                ..Default::default()
            })),
        }
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    pub fn login_count(&self) -> u32 {
        self.state.lock().logins
    }

    /// Script the order book returned by [`BrokerGateway::order_book`];
    /// `None` simulates the broker's null response.
    pub fn set_order_book(&self, book: Option<Vec<OrderMsg>>) {
        self.state.lock().order_book = book;
    }

    pub fn set_history(&self, order_no: &str, rows: Vec<OrderMsg>) {
        self.state.lock().history.insert(order_no.to_string(), rows);
    }

    /// The next `n` placements answer null.
    pub fn fail_next_places(&self, n: u32) {
        self.state.lock().fail_places = n;
    }

    pub fn fail_next_modifies(&self, n: u32) {
        self.state.lock().fail_modifies = n;
    }

    pub fn fail_next_cancels(&self, n: u32) {
        self.state.lock().fail_cancels = n;
    }

    /// Push a socket event as if the broker delivered it.
    pub fn emit(&self, event: SocketEvent) {
        let tx = self.state.lock().events_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    fn take_failure(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn login(&self) -> Result<Session> {
        let mut state = self.state.lock();
        state.logins += 1;
        Ok(Session {
            user_id: "PAPER".to_string(),
            token: format!("paper-session-{}", state.logins),
        })
    }

    async fn place_order(&self, order: &PlaceOrder) -> Option<OrderAck> {
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::Place(order.clone()));
        if Self::take_failure(&mut state.fail_places) {
            return None;
        }
        state.next_order_no += 1;
        let order_no = state.next_order_no.to_string();
        debug!("paper placement {} ({})", order_no, order.remarks);
        Some(OrderAck { order_no })
    }

    async fn modify_order(&self, modify: &ModifyOrder) -> Option<OrderAck> {
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::Modify(modify.clone()));
        if Self::take_failure(&mut state.fail_modifies) {
            return None;
        }
        Some(OrderAck {
            order_no: modify.order_no.clone(),
        })
    }

    async fn cancel_order(&self, order_no: &str) -> Option<OrderAck> {
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::Cancel(order_no.to_string()));
        if Self::take_failure(&mut state.fail_cancels) {
            return None;
        }
        Some(OrderAck {
            order_no: order_no.to_string(),
        })
    }

    async fn close_bracket_order(&self, order_no: &str) -> Option<OrderAck> {
        let mut state = self.state.lock();
        state
            .calls
            .push(GatewayCall::CloseBracket(order_no.to_string()));
        Some(OrderAck {
            order_no: order_no.to_string(),
        })
    }

    async fn order_book(&self) -> Option<Vec<OrderMsg>> {
        self.state.lock().order_book.clone()
    }

    async fn order_history(&self, order_no: &str) -> Option<Vec<OrderMsg>> {
        Some(
            self.state
                .lock()
                .history
                .get(order_no)
                .cloned()
                .unwrap_or_default(),
        )
    }

    async fn start_socket(&self, events: UnboundedSender<SocketEvent>) -> Result<()> {
        self.state.lock().events_tx = Some(events);
        Ok(())
    }

    async fn subscribe(&self, instruments: &[String]) {
        self.state
            .lock()
            .calls
            .push(GatewayCall::Subscribe(instruments.to_vec()));
    }

    async fn subscribe_orders(&self) {
        self.state.lock().calls.push(GatewayCall::SubscribeOrders);
    }

    async fn unsubscribe(&self, instruments: &[String]) {
        self.state
            .lock()
            .calls
            .push(GatewayCall::Unsubscribe(instruments.to_vec()));
    }
}

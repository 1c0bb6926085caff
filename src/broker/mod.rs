//! Broker gateway: the single seam between the engine and the vendor.
//!
//! Concrete bindings (live Noren, paper) implement [`BrokerGateway`]; the
//! engine only ever sees the [`retry::Retrying`] wrapper, which owns the
//! null-response re-login policy in one place.

pub mod classify;
pub mod noren;
pub mod paper;
pub mod retry;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use types::{ModifyOrder, OrderAck, OrderMsg, PlaceOrder, QuoteTick, Session};

/// The broker's four websocket callbacks, expressed as one tagged stream
/// delivered over an mpsc channel so a single writer can serialize them.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Opened,
    Quote(QuoteTick),
    Order(OrderMsg),
    Error(String),
}

/// The narrow contract the engine consumes.
///
/// `Option`-returning calls use `None` for the broker's transient null
/// response; the retry decorator translates that into one re-login + retry.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn login(&self) -> Result<Session>;

    async fn place_order(&self, order: &PlaceOrder) -> Option<OrderAck>;

    async fn modify_order(&self, modify: &ModifyOrder) -> Option<OrderAck>;

    async fn cancel_order(&self, order_no: &str) -> Option<OrderAck>;

    /// Exit both children of a bracket at market.
    async fn close_bracket_order(&self, order_no: &str) -> Option<OrderAck>;

    async fn order_book(&self) -> Option<Vec<OrderMsg>>;

    async fn order_history(&self, order_no: &str) -> Option<Vec<OrderMsg>>;

    /// Inspect the order history for a rejection of the latest modify.
    async fn is_sl_update_rejected(&self, order_no: &str) -> (bool, String) {
        match self.order_history(order_no).await {
            Some(hist) => hist
                .iter()
                .find(|row| row.status == "REJECTED")
                .map(|row| {
                    (
                        true,
                        row.reject_reason
                            .clone()
                            .unwrap_or_else(|| "NA".to_string()),
                    )
                })
                .unwrap_or((false, "NA".to_string())),
            None => (false, "NA".to_string()),
        }
    }

    /// Open the websocket; events flow into `events` until the connection
    /// drops, which is reported as [`SocketEvent::Error`].
    async fn start_socket(&self, events: UnboundedSender<SocketEvent>) -> Result<()>;

    /// Subscribe touchline quotes for `{exchange}|{token}` instrument keys.
    async fn subscribe(&self, instruments: &[String]);

    /// Subscribe the account's order-update feed.
    async fn subscribe_orders(&self);

    async fn unsubscribe(&self, instruments: &[String]);
}

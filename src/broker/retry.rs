//! Re-login + one-shot retry over any gateway.
//!
//! The broker returns a bare null on transient failures (expired session,
//! gateway hiccup). Policy: log in again, retry the call once, and hand a
//! still-null result back to the caller unchanged. Implemented here once so
//! call sites never carry retry loops.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use super::types::{ModifyOrder, OrderAck, OrderMsg, PlaceOrder, Session};
use super::{BrokerGateway, SocketEvent};

pub struct Retrying<G> {
    inner: G,
}

impl<G: BrokerGateway> Retrying<G> {
    pub fn new(inner: G) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    async fn relogin(&self, what: &str) -> bool {
        warn!("{}: null broker response, re-logging in and retrying once", what);
        match self.inner.login().await {
            Ok(_) => true,
            Err(e) => {
                warn!("{}: re-login failed: {:#}", what, e);
                false
            }
        }
    }
}

#[async_trait]
impl<G: BrokerGateway> BrokerGateway for Retrying<G> {
    async fn login(&self) -> Result<Session> {
        self.inner.login().await
    }

    async fn place_order(&self, order: &PlaceOrder) -> Option<OrderAck> {
        if let Some(ack) = self.inner.place_order(order).await {
            return Some(ack);
        }
        if !self.relogin("place_order").await {
            return None;
        }
        self.inner.place_order(order).await
    }

    async fn modify_order(&self, modify: &ModifyOrder) -> Option<OrderAck> {
        if let Some(ack) = self.inner.modify_order(modify).await {
            return Some(ack);
        }
        if !self.relogin("modify_order").await {
            return None;
        }
        self.inner.modify_order(modify).await
    }

    async fn cancel_order(&self, order_no: &str) -> Option<OrderAck> {
        if let Some(ack) = self.inner.cancel_order(order_no).await {
            return Some(ack);
        }
        if !self.relogin("cancel_order").await {
            return None;
        }
        self.inner.cancel_order(order_no).await
    }

    async fn close_bracket_order(&self, order_no: &str) -> Option<OrderAck> {
        if let Some(ack) = self.inner.close_bracket_order(order_no).await {
            return Some(ack);
        }
        if !self.relogin("close_bracket_order").await {
            return None;
        }
        self.inner.close_bracket_order(order_no).await
    }

    async fn order_book(&self) -> Option<Vec<OrderMsg>> {
        if let Some(book) = self.inner.order_book().await {
            return Some(book);
        }
        if !self.relogin("order_book").await {
            return None;
        }
        self.inner.order_book().await
    }

    async fn order_history(&self, order_no: &str) -> Option<Vec<OrderMsg>> {
        if let Some(hist) = self.inner.order_history(order_no).await {
            return Some(hist);
        }
        if !self.relogin("order_history").await {
            return None;
        }
        self.inner.order_history(order_no).await
    }

    async fn is_sl_update_rejected(&self, order_no: &str) -> (bool, String) {
        // Runs on top of the already-retried order_history above.
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

    async fn start_socket(&self, events: UnboundedSender<SocketEvent>) -> Result<()> {
        self.inner.start_socket(events).await
    }

    async fn subscribe(&self, instruments: &[String]) {
        self.inner.subscribe(instruments).await
    }

    async fn subscribe_orders(&self) {
        self.inner.subscribe_orders().await
    }

    async fn unsubscribe(&self, instruments: &[String]) {
        self.inner.unsubscribe(instruments).await
    }
}

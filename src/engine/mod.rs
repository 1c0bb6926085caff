//! The order-lifecycle event processor.
//!
//! One engine instance per account session. A single task owns the position
//! table and drains one unbounded queue carrying market ticks, order updates,
//! socket lifecycle events and the clock's control messages, so every
//! mutation is serialized: no tick can be applied after FLATTEN has been
//! dequeued, and events for one position apply in arrival order.
//!
//! Broker calls happen inline on the writer and intentionally backpressure
//! the queue; the per-account event rate is tens per second at peak and the
//! lifecycle stays simple.

pub mod loader;
pub mod session;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::broker::classify::{classify, Classified, LegKind, LogicalStatus};
use crate::broker::types::{
    now_epoch, ModifyOrder, OrderMsg, PlaceOrder, PriceType, ProductType, QuoteTick,
    TransactionSide,
};
use crate::broker::{BrokerGateway, SocketEvent};
use crate::models::{ActiveFlag, OrderStatus, Position};
use crate::risk::{calc_sl, calc_target, fmt_price, get_new_sl, round_price, signal_strength};
use crate::storage::{LogService, STAGE_POST_BOD};

/// Placeholder entry order id set between placement and the first order
/// update; blocks duplicate placement on subsequent ticks.
pub const ENTRY_PLACEHOLDER: &str = "-1";

/// Everything the writer task dequeues, in one total order.
#[derive(Debug)]
pub enum EngineEvent {
    Socket(SocketEvent),
    /// 09:30 control message: snapshot post-BOD params and emit the summary.
    Alert,
    /// 15:15 control message: close every exposed row and stop the loop.
    Flatten,
}

pub struct Engine<G> {
    account: String,
    session_date: String,
    gateway: G,
    log: Arc<LogService>,
    positions: Vec<Position>,
    /// Sink handed to the gateway on (re)connect; kept for socket restarts.
    socket_tx: UnboundedSender<SocketEvent>,
    reconnect_count: u32,
}

impl<G: BrokerGateway> Engine<G> {
    pub fn new(
        account: String,
        session_date: String,
        gateway: G,
        log: Arc<LogService>,
        positions: Vec<Position>,
        socket_tx: UnboundedSender<SocketEvent>,
    ) -> Self {
        Self {
            account,
            session_date,
            gateway,
            log,
            positions,
            socket_tx,
            reconnect_count: 0,
        }
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn into_positions(self) -> Vec<Position> {
        self.positions
    }

    /// Tear down into the frozen table and the gateway, for the CoB handoff.
    pub fn into_parts(self) -> (Vec<Position>, G) {
        (self.positions, self.gateway)
    }

    /// Distinct `{exchange}|{token}` subscription keys for the table.
    pub fn instruments(&self) -> Vec<String> {
        let keys: BTreeSet<String> = self
            .positions
            .iter()
            .map(Position::instrument_key)
            .collect();
        keys.into_iter().collect()
    }

    /// Drain events until flatten. Never returns early on broker failures;
    /// the error policy is log-and-mark.
    pub async fn run(&mut self, rx: &mut UnboundedReceiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
    }

    /// Apply one event; `false` means the session is over (flatten applied).
    pub async fn handle_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Socket(SocketEvent::Opened) => self.on_open().await,
            EngineEvent::Socket(SocketEvent::Quote(tick)) => self.on_quote(tick).await,
            EngineEvent::Socket(SocketEvent::Order(msg)) => self.on_order_update(msg).await,
            EngineEvent::Socket(SocketEvent::Error(message)) => self.on_socket_error(message).await,
            EngineEvent::Alert => self.on_alert(),
            EngineEvent::Flatten => {
                self.flatten().await;
                return false;
            }
        }
        true
    }

    async fn on_open(&mut self) {
        let instruments = self.instruments();
        info!("socket open; subscribing {:?}", instruments);
        self.gateway.subscribe(&instruments).await;
        self.gateway.subscribe_orders().await;
    }

    async fn on_quote(&mut self, tick: QuoteTick) {
        let ltp = match tick.ltp() {
            Some(ltp) => ltp,
            None => return,
        };

        // Entry pass: rows on this token still waiting for their first
        // favourable tick.
        let waiting: Vec<usize> = self
            .positions
            .iter()
            .filter(|p| p.token == tick.token && p.entry_order_id.is_none() && p.is_active())
            .map(|p| p.index)
            .collect();
        for idx in waiting {
            let strength = {
                let p = &mut self.positions[idx];
                let strength = signal_strength(p.signal, p.target, ltp);
                p.strength = Some(strength);
                strength
            };
            if strength > 0.0 {
                self.place_bracket(idx, ltp, strength).await;
            } else {
                let p = &mut self.positions[idx];
                p.active = ActiveFlag::No;
                p.entry_order_status = Some(OrderStatus::Invalid);
                info!(
                    "{}: strength {:.2} at ltp {:.2}, signal invalid for the day",
                    p.scrip, strength, ltp
                );
            }
        }

        // Trailing pass: rows on this token with an armed stop.
        let armed: Vec<usize> = self
            .positions
            .iter()
            .filter(|p| p.token == tick.token && p.sl_order_id.is_some() && p.is_active())
            .map(|p| p.index)
            .collect();
        for idx in armed {
            let Some(new_sl) = get_new_sl(&self.positions[idx], ltp) else {
                continue;
            };
            let modify = {
                let p = &self.positions[idx];
                ModifyOrder {
                    order_no: p.sl_order_id.clone().unwrap_or_default(),
                    exchange: p.exchange.clone(),
                    symbol: p.symbol.clone(),
                    new_quantity: p.quantity,
                    new_price_type: PriceType::StopLossMarket,
                    new_trigger_price: Some(fmt_price(new_sl)),
                }
            };
            match self.gateway.modify_order(&modify).await {
                Some(_) => {
                    // Optimistic; the TRIGGER_PENDING update reconciles it.
                    let p = &mut self.positions[idx];
                    p.sl_price = Some(new_sl);
                    info!("{}: trailed stop to {:.2} at ltp {:.2}", p.scrip, new_sl, ltp);
                }
                None => {
                    let p = &self.positions[idx];
                    error!("{}: stop modify returned null, keeping {:?}", p.scrip, p.sl_price);
                }
            }
        }
    }

    /// Place the native bracket for one row. The placeholder id goes in
    /// before the broker call so a second tick can never double-place; the
    /// real id and fills arrive through order updates.
    async fn place_bracket(&mut self, idx: usize, ltp: f64, strength: f64) {
        let order = {
            let p = &mut self.positions[idx];
            p.entry_order_id = Some(ENTRY_PLACEHOLDER.to_string());

            let sl_px = calc_sl(ltp, p.signal, p.sl_pct, p.tick);
            let sl_range = round_price((ltp - sl_px).abs(), p.tick);
            let target_px = round_price(calc_target(p.target, ltp, p.signal, strength), p.tick);
            let target_range = round_price((target_px - ltp).abs(), p.tick);
            let remarks = ["BO", &p.model, &p.scrip, &idx.to_string()].join(":");

            debug!(
                "{}: placing bracket at ltp {:.2} (sl range {}, target range {})",
                p.scrip,
                ltp,
                fmt_price(sl_range),
                fmt_price(target_range)
            );

            PlaceOrder {
                side: TransactionSide::from_signal(p.signal),
                product: ProductType::Bracket,
                exchange: p.exchange.clone(),
                symbol: p.symbol.clone(),
                quantity: p.quantity,
                price_type: PriceType::Market,
                price: "0.00".to_string(),
                trigger_price: None,
                retention: "DAY".to_string(),
                remarks,
                book_loss_range: Some(fmt_price(sl_range)),
                book_profit_range: Some(fmt_price(target_range)),
            }
        };

        match self.gateway.place_order(&order).await {
            Some(ack) => {
                debug!("bracket accepted as {} ({})", ack.order_no, order.remarks);
            }
            None => {
                // Placeholder stays: no re-attempt until the day's snapshot
                // is corrected manually.
                error!("bracket placement returned null ({})", order.remarks);
            }
        }
    }

    async fn on_order_update(&mut self, msg: OrderMsg) {
        let Some(classified) = classify(&msg) else {
            debug!("skipping order update {} without engine tags", msg.order_no);
            return;
        };
        let Some(idx) = self.locate(&classified, &msg) else {
            debug!("no position row for order update {}", msg.order_no);
            return;
        };
        if !self.positions[idx].is_active() {
            // Tie-break: first terminal event won, later ones are observed
            // but ignored.
            debug!(
                "{}: event for frozen row ignored ({} {})",
                self.positions[idx].scrip, msg.order_no, msg.status
            );
            return;
        }

        let ts = msg.event_ts();
        match classified.leg {
            LegKind::Entry => self.apply_entry(idx, &msg, &classified, ts),
            LegKind::StopLoss => self.apply_stop(idx, &msg, &classified, ts).await,
            LegKind::Target => self.apply_target(idx, &msg, &classified, ts).await,
        }
    }

    fn locate(&self, classified: &Classified, msg: &OrderMsg) -> Option<usize> {
        if let Some(idx) = classified.index {
            if idx < self.positions.len() {
                return Some(idx);
            }
            warn!("order update {} names unknown row {}", msg.order_no, idx);
            return None;
        }
        // Parent/child path without remarks: resolve by order id.
        let order_no = msg.order_no.as_str();
        self.positions
            .iter()
            .find(|p| {
                p.entry_order_id.as_deref() == Some(order_no)
                    || p.sl_order_id.as_deref() == Some(order_no)
                    || p.target_order_id.as_deref() == Some(order_no)
            })
            .map(|p| p.index)
    }

    fn apply_entry(&mut self, idx: usize, msg: &OrderMsg, classified: &Classified, ts: i64) {
        let p = &mut self.positions[idx];
        p.entry_order_id = Some(msg.order_no.clone());
        p.entry_order_status = Some(classified.native);
        p.entry_ts = Some(ts);
        if let Some(px) = msg.entry_fill_price() {
            if px > 0.0 {
                p.entry_price = Some(px);
            }
        }
        match &classified.status {
            LogicalStatus::Rejected(reason) => {
                p.active = ActiveFlag::No;
                error!("{}: entry rejected: {}", p.scrip, reason);
            }
            LogicalStatus::EntryFilled => {
                info!(
                    "{}: entry filled at {:?} ({})",
                    p.scrip, p.entry_price, msg.order_no
                );
            }
            _ => {}
        }
    }

    async fn apply_stop(&mut self, idx: usize, msg: &OrderMsg, classified: &Classified, ts: i64) {
        {
            let p = &mut self.positions[idx];
            p.sl_order_id = Some(msg.order_no.clone());
            p.sl_order_status = Some(classified.native);
            p.sl_ts = Some(ts);
            if let Some(px) = msg.trigger_price().or_else(|| msg.avg_price()) {
                if px > 0.0 {
                    p.sl_price = Some(px);
                }
            }
        }

        match &classified.status {
            LogicalStatus::SlArmed => {
                self.positions[idx].sl_update_cnt += 1;
                // The broker acks rejected modifies with a TRIGGER_PENDING
                // event for the old trigger; only the history tells.
                let (rejected, reason) =
                    self.gateway.is_sl_update_rejected(&msg.order_no).await;
                if rejected {
                    let p = &mut self.positions[idx];
                    p.active = ActiveFlag::SlRejected;
                    error!("{}: stop modify rejected ({}), row parked", p.scrip, reason);
                }
            }
            LogicalStatus::SlHit => {
                // Close the row and cancel the opposite leg.
                self.positions[idx].active = ActiveFlag::No;
                info!(
                    "{}: stop hit at {:?}",
                    self.positions[idx].scrip, self.positions[idx].sl_price
                );
                let target_id = self.positions[idx].target_order_id.clone();
                if let Some(target_id) = target_id {
                    if self.gateway.cancel_order(&target_id).await.is_some() {
                        let p = &mut self.positions[idx];
                        p.target_order_status = Some(OrderStatus::Canceled);
                        p.target_ts = Some(ts);
                    } else {
                        error!("cancel of target {} returned null", target_id);
                    }
                }
            }
            LogicalStatus::Rejected(reason) => {
                error!("{}: stop leg rejected: {}", self.positions[idx].scrip, reason);
            }
            _ => {}
        }
    }

    async fn apply_target(&mut self, idx: usize, msg: &OrderMsg, classified: &Classified, ts: i64) {
        {
            let p = &mut self.positions[idx];
            p.target_order_id = Some(msg.order_no.clone());
            p.target_order_status = Some(classified.native);
            p.target_ts = Some(ts);
            if let Some(px) = msg.target_leg_price() {
                if px > 0.0 {
                    p.target_price = Some(px);
                }
            }
        }

        match &classified.status {
            LogicalStatus::TargetHit => {
                // Close the row and cancel the stop.
                self.positions[idx].active = ActiveFlag::No;
                info!(
                    "{}: target hit at {:?}",
                    self.positions[idx].scrip, self.positions[idx].target_price
                );
                let sl_id = self.positions[idx].sl_order_id.clone();
                if let Some(sl_id) = sl_id {
                    if self.gateway.cancel_order(&sl_id).await.is_some() {
                        let p = &mut self.positions[idx];
                        p.sl_order_status = Some(OrderStatus::Canceled);
                        p.sl_ts = Some(ts);
                    } else {
                        error!("cancel of stop {} returned null", sl_id);
                    }
                }
            }
            LogicalStatus::Rejected(reason) => {
                error!("{}: target leg rejected: {}", self.positions[idx].scrip, reason);
            }
            _ => {}
        }
    }

    async fn on_socket_error(&mut self, message: String) {
        self.reconnect_count += 1;
        error!(
            attempt = self.reconnect_count,
            account = %self.account,
            "websocket error: {}",
            message
        );
        let instruments = self.instruments();
        self.gateway.unsubscribe(&instruments).await;
        if let Err(e) = self.gateway.start_socket(self.socket_tx.clone()).await {
            error!("websocket restart failed: {:#}", e);
        }
    }

    fn on_alert(&mut self) {
        let active = self.positions.iter().filter(|p| p.is_active()).count();
        info!(
            account = %self.account,
            active, total = self.positions.len(),
            "post-BOD checkpoint"
        );
        if let Err(e) =
            self.log
                .log_params(&self.account, &self.session_date, STAGE_POST_BOD, &self.positions)
        {
            error!("post-BOD snapshot failed: {:#}", e);
        }
    }

    /// Session cutoff: exit every exposed row at market and deactivate the
    /// rest. Afterwards no row is `active = Y`.
    pub async fn flatten(&mut self) {
        let instruments = self.instruments();
        self.gateway.unsubscribe(&instruments).await;

        let exposed: Vec<usize> = self
            .positions
            .iter()
            .filter(|p| p.is_exposed())
            .map(|p| p.index)
            .collect();
        info!("flatten: {} exposed rows", exposed.len());

        for idx in exposed {
            let entered = self.positions[idx].entry_ts.is_some();
            if entered {
                let (modify, target_id, entry_id) = {
                    let p = &self.positions[idx];
                    (
                        p.sl_order_id.as_ref().map(|sl_id| ModifyOrder {
                            order_no: sl_id.clone(),
                            exchange: p.exchange.clone(),
                            symbol: p.symbol.clone(),
                            new_quantity: p.quantity,
                            new_price_type: PriceType::Market,
                            new_trigger_price: None,
                        }),
                        p.target_order_id.clone(),
                        p.entry_order_id.clone(),
                    )
                };
                if modify.is_none() && target_id.is_none() {
                    // No addressable children (ids never arrived): exit the
                    // whole bracket through its parent.
                    match entry_id.as_deref() {
                        Some(entry_id) if entry_id != ENTRY_PLACEHOLDER => {
                            if self.gateway.close_bracket_order(entry_id).await.is_none() {
                                error!("flatten: bracket close {} returned null", entry_id);
                            }
                        }
                        _ => {}
                    }
                }
                // Exit by converting the live stop into a market order.
                if let Some(modify) = modify {
                    if self.gateway.modify_order(&modify).await.is_none() {
                        error!("flatten: stop-to-market for row {} returned null", idx);
                    }
                }
                if let Some(target_id) = target_id {
                    if self.gateway.cancel_order(&target_id).await.is_none() {
                        error!("flatten: target cancel for row {} returned null", idx);
                    }
                }
                let p = &mut self.positions[idx];
                p.target_order_status = Some(OrderStatus::Canceled);
                p.target_ts = Some(now_epoch());
            }
            self.positions[idx].active = ActiveFlag::No;
        }
        info!("flatten complete");
    }
}

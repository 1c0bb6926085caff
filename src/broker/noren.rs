//! Noren (Shoonya) broker binding: form-encoded REST calls plus the
//! touchline/order websocket.
//!
//! Every REST endpoint takes `jData=<json>&jKey=<session token>` and answers
//! `{"stat":"Ok", ...}` on success; anything else is treated as the broker's
//! null response and surfaced as `None` for the retry layer. The websocket
//! task owns the connection and forwards frames as [`SocketEvent`]s; a
//! command channel carries subscribe/unsubscribe frames back in.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::BrokerCredentials;

use super::types::{ModifyOrder, OrderAck, OrderMsg, PlaceOrder, QuoteTick, Session};
use super::{BrokerGateway, SocketEvent};

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

enum WsCommand {
    Send(String),
}

pub struct NorenGateway {
    creds: BrokerCredentials,
    http: reqwest::Client,
    session: Mutex<Option<Session>>,
    ws_cmd: Mutex<Option<UnboundedSender<WsCommand>>>,
}

impl NorenGateway {
    pub fn new(creds: BrokerCredentials) -> Self {
        Self {
            creds,
            http: reqwest::Client::new(),
            session: Mutex::new(None),
            ws_cmd: Mutex::new(None),
        }
    }

    fn session_token(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.token.clone())
    }

    /// POST one endpoint; `None` on transport error, non-JSON body, or a
    /// non-`Ok` stat.
    async fn post(&self, endpoint: &str, jdata: Value) -> Option<Value> {
        let token = match self.session_token() {
            Some(t) => t,
            None => {
                warn!("{}: no session, call dropped", endpoint);
                return None;
            }
        };
        let url = format!("{}/{}", self.creds.base_url.trim_end_matches('/'), endpoint);
        let body = format!("jData={}&jKey={}", jdata, token);
        let resp = match self.http.post(&url).body(body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: transport error: {}", endpoint, e);
                return None;
            }
        };
        let value: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: malformed response: {}", endpoint, e);
                return None;
            }
        };
        if value.get("stat").and_then(Value::as_str) == Some("Ok") || value.is_array() {
            Some(value)
        } else {
            warn!("{}: broker rejected call: {}", endpoint, value);
            None
        }
    }

    fn send_ws(&self, frame: Value) {
        let guard = self.ws_cmd.lock();
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(WsCommand::Send(frame.to_string()));
            }
            None => warn!("websocket not started, dropping frame {}", frame),
        }
    }
}

#[async_trait::async_trait]
impl BrokerGateway for NorenGateway {
    async fn login(&self) -> Result<Session> {
        let jdata = json!({
            "apkversion": "1.0.0",
            "uid": self.creds.user_id,
            "pwd": sha256_hex(&self.creds.password),
            "factor2": self.creds.factor2,
            "vc": self.creds.vendor_code,
            "appkey": sha256_hex(&format!("{}|{}", self.creds.user_id, self.creds.api_key)),
            "imei": self.creds.imei,
            "source": "API",
        });
        let url = format!("{}/QuickAuth", self.creds.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .body(format!("jData={}", jdata))
            .send()
            .await
            .context("login transport error")?;
        let value: Value = resp.json().await.context("login response not JSON")?;
        if value.get("stat").and_then(Value::as_str) != Some("Ok") {
            return Err(anyhow!(
                "login rejected: {}",
                value.get("emsg").and_then(Value::as_str).unwrap_or("unknown")
            ));
        }
        let token = value
            .get("susertoken")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("login response missing susertoken"))?
            .to_string();
        let session = Session {
            user_id: self.creds.user_id.clone(),
            token,
        };
        *self.session.lock() = Some(session.clone());
        info!("logged in as {}", session.user_id);
        Ok(session)
    }

    async fn place_order(&self, order: &PlaceOrder) -> Option<OrderAck> {
        let mut jdata = json!({
            "uid": self.creds.user_id,
            "actid": self.creds.user_id,
            "exch": order.exchange,
            "tsym": order.symbol,
            "qty": order.quantity.to_string(),
            "dscqty": "0",
            "prd": order.product.wire(),
            "trantype": order.side.wire(),
            "prctyp": order.price_type.wire(),
            "prc": order.price,
            "ret": order.retention,
            "remarks": order.remarks,
        });
        if let Some(trg) = &order.trigger_price {
            jdata["trgprc"] = json!(trg);
        }
        if let Some(bl) = &order.book_loss_range {
            jdata["blprc"] = json!(bl);
        }
        if let Some(bp) = &order.book_profit_range {
            jdata["bpprc"] = json!(bp);
        }
        let resp = self.post("PlaceOrder", jdata).await?;
        let order_no = resp.get("norenordno")?.as_str()?.to_string();
        debug!("placed order {} ({})", order_no, order.remarks);
        Some(OrderAck { order_no })
    }

    async fn modify_order(&self, modify: &ModifyOrder) -> Option<OrderAck> {
        let mut jdata = json!({
            "uid": self.creds.user_id,
            "norenordno": modify.order_no,
            "exch": modify.exchange,
            "tsym": modify.symbol,
            "qty": modify.new_quantity.to_string(),
            "prctyp": modify.new_price_type.wire(),
        });
        if let Some(trg) = &modify.new_trigger_price {
            jdata["trgprc"] = json!(trg);
        }
        let resp = self.post("ModifyOrder", jdata).await?;
        let order_no = resp
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or(&modify.order_no)
            .to_string();
        Some(OrderAck { order_no })
    }

    async fn cancel_order(&self, order_no: &str) -> Option<OrderAck> {
        let jdata = json!({
            "uid": self.creds.user_id,
            "norenordno": order_no,
        });
        let resp = self.post("CancelOrder", jdata).await?;
        let order_no = resp
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or(order_no)
            .to_string();
        Some(OrderAck { order_no })
    }

    async fn close_bracket_order(&self, order_no: &str) -> Option<OrderAck> {
        let jdata = json!({
            "uid": self.creds.user_id,
            "norenordno": order_no,
            "prd": "B",
        });
        self.post("ExitSNOOrder", jdata).await?;
        Some(OrderAck {
            order_no: order_no.to_string(),
        })
    }

    async fn order_book(&self) -> Option<Vec<OrderMsg>> {
        let jdata = json!({ "uid": self.creds.user_id });
        let resp = self.post("OrderBook", jdata).await?;
        serde_json::from_value(resp).ok()
    }

    async fn order_history(&self, order_no: &str) -> Option<Vec<OrderMsg>> {
        let jdata = json!({
            "uid": self.creds.user_id,
            "norenordno": order_no,
        });
        let resp = self.post("SingleOrdHist", jdata).await?;
        serde_json::from_value(resp).ok()
    }

    async fn start_socket(&self, events: UnboundedSender<SocketEvent>) -> Result<()> {
        let session = self
            .session
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("websocket requires a logged-in session"))?;
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        *self.ws_cmd.lock() = Some(cmd_tx);

        let ws_url = self.creds.ws_url.clone();
        tokio::spawn(async move {
            let (ws_stream, _) = match connect_async(&ws_url).await {
                Ok(ok) => ok,
                Err(e) => {
                    let _ = events.send(SocketEvent::Error(format!("connect failed: {}", e)));
                    return;
                }
            };
            info!("broker websocket connected");
            let (mut write, mut read) = ws_stream.split();

            let connect_frame = json!({
                "t": "c",
                "uid": session.user_id,
                "actid": session.user_id,
                "susertoken": session.token,
                "source": "API",
            });
            if let Err(e) = write.send(Message::Text(connect_frame.to_string())).await {
                let _ = events.send(SocketEvent::Error(format!("connect frame failed: {}", e)));
                return;
            }

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(WsCommand::Send(frame)) => {
                                if let Err(e) = write.send(Message::Text(frame)).await {
                                    let _ = events.send(SocketEvent::Error(
                                        format!("websocket write failed: {}", e)));
                                    return;
                                }
                            }
                            // Gateway dropped; the session is over.
                            None => return,
                        }
                    }
                    frame = read.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(event) = parse_frame(&text) {
                                    if events.send(event).is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = events.send(SocketEvent::Error(
                                    "websocket closed by broker".to_string()));
                                return;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = events.send(SocketEvent::Error(
                                    format!("websocket read failed: {}", e)));
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn subscribe(&self, instruments: &[String]) {
        if instruments.is_empty() {
            return;
        }
        self.send_ws(json!({ "t": "t", "k": instruments.join("#") }));
    }

    async fn subscribe_orders(&self) {
        self.send_ws(json!({ "t": "o" }));
    }

    async fn unsubscribe(&self, instruments: &[String]) {
        if instruments.is_empty() {
            return;
        }
        self.send_ws(json!({ "t": "u", "k": instruments.join("#") }));
    }
}

/// Map one websocket frame to a [`SocketEvent`]; unknown frame types are
/// dropped after a debug log.
fn parse_frame(text: &str) -> Option<SocketEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("unparseable websocket frame: {} ({})", text, e);
            return None;
        }
    };
    match value.get("t").and_then(Value::as_str) {
        Some("ck") => {
            if value.get("s").and_then(Value::as_str) == Some("OK") {
                Some(SocketEvent::Opened)
            } else {
                Some(SocketEvent::Error(format!("websocket auth failed: {}", value)))
            }
        }
        // Touchline acknowledgement + feed updates carry the same shape.
        Some("tk") | Some("tf") => serde_json::from_value::<QuoteTick>(value)
            .ok()
            .map(SocketEvent::Quote),
        Some("om") => serde_json::from_value::<OrderMsg>(value)
            .ok()
            .map(SocketEvent::Order),
        other => {
            debug!("ignoring websocket frame type {:?}", other);
            None
        }
    }
}

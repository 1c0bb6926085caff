//! End-to-end lifecycle scenarios driven through the paper gateway.
//!
//! Each test feeds the engine the exact event stream a session would see and
//! asserts on the position table and the recorded broker calls.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveTime;
use tokio::sync::mpsc;

use bracketbot::broker::paper::{GatewayCall, PaperGateway};
use bracketbot::broker::retry::Retrying;
use bracketbot::broker::types::{OrderMsg, QuoteTick};
use bracketbot::broker::SocketEvent;
use bracketbot::engine::loader::load_params;
use bracketbot::engine::{Engine, EngineEvent, ENTRY_PLACEHOLDER};
use bracketbot::models::{ActiveFlag, Config, OrderStatus, Position};
use bracketbot::storage::{LogService, STAGE_PRE_COB};

const ENTRIES_ONE_BUY: &str = "\
scrip,symbol,exchange,token,model,signal,quantity,target,tick,sl_pct,trail_sl_pct
NSE_ACME,ACME-EQ,NSE,22,gspcV2,1,10,110.0,0.05,1.0,0.5
";

const ENTRIES_ONE_SELL: &str = "\
scrip,symbol,exchange,token,model,signal,quantity,target,tick,sl_pct,trail_sl_pct
NSE_OMEGA,OMEGA-EQ,NSE,44,gspcV2,-1,5,195.0,0.05,1.0,0.5
";

const ENTRIES_THREE_MODELS: &str = "\
scrip,symbol,exchange,token,model,signal,quantity,target,tick,sl_pct,trail_sl_pct
NSE_ACME,ACME-EQ,NSE,22,gspcV2,1,10,110.0,0.05,1.0,0.5
NSE_ACME,ACME-EQ,NSE,22,trendV1,1,20,112.0,0.05,1.0,0.5
NSE_ACME,ACME-EQ,NSE,22,meanrev,-1,15,95.0,0.05,1.0,0.5
";

struct Fixture {
    engine: Engine<Retrying<PaperGateway>>,
    paper: PaperGateway,
    log: Arc<LogService>,
    _dir: tempfile::TempDir,
    _socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
}

fn config(dir: &Path) -> Config {
    Config {
        account: "ACCT".to_string(),
        data_dir: dir.to_path_buf(),
        tick_data_dir: dir.to_path_buf(),
        database_path: dir.join("session.db"),
        alert_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
        cutoff_time: NaiveTime::from_hms_opt(15, 15, 0).unwrap(),
        broker: None,
    }
}

async fn fixture(entries: &str) -> Fixture {
    fixture_with_book(entries, Some(Vec::new())).await
}

async fn fixture_with_book(entries: &str, order_book: Option<Vec<OrderMsg>>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let mut file = std::fs::File::create(cfg.entries_path()).unwrap();
    file.write_all(entries.as_bytes()).unwrap();

    let log = Arc::new(LogService::open(&cfg.database_path).unwrap());
    let paper = PaperGateway::new();
    paper.set_order_book(order_book);

    let positions = load_params(&cfg, &paper, &log, "2023-11-01").await.unwrap();
    let (socket_tx, socket_rx) = mpsc::unbounded_channel();
    let engine = Engine::new(
        "ACCT".to_string(),
        "2023-11-01".to_string(),
        Retrying::new(paper.clone()),
        Arc::clone(&log),
        positions,
        socket_tx,
    );
    Fixture {
        engine,
        paper,
        log,
        _dir: dir,
        _socket_rx: socket_rx,
    }
}

fn quote(token: &str, ltp: f64, ft: i64) -> EngineEvent {
    EngineEvent::Socket(SocketEvent::Quote(QuoteTick {
        token: token.to_string(),
        exchange: Some("NSE".to_string()),
        lp: Some(format!("{:.2}", ltp)),
        ft: Some(ft.to_string()),
    }))
}

fn update(leg: &str, model: &str, scrip: &str, idx: usize, order_no: &str, status: &str) -> OrderMsg {
    OrderMsg {
        order_no: order_no.to_string(),
        status: status.to_string(),
        remarks: Some(format!("{}:{}:{}:{}", leg, model, scrip, idx)),
        exchange_time: Some("01-11-2023 10:00:00".to_string()),
        ..Default::default()
    }
}

fn order_event(msg: OrderMsg) -> EngineEvent {
    EngineEvent::Socket(SocketEvent::Order(msg))
}

fn place_count(paper: &PaperGateway) -> usize {
    paper
        .calls()
        .iter()
        .filter(|c| matches!(c, GatewayCall::Place(_)))
        .count()
}

/// S1: buy row triggers on a favourable quote, the stop trails on a
/// favourable move, the target fill cancels the stop.
#[tokio::test]
async fn s1_full_buy_lifecycle() {
    let mut fx = fixture(ENTRIES_ONE_BUY).await;

    // First quote at 100: strength 10 > 0, bracket goes out.
    fx.engine.handle_event(quote("22", 100.0, 1_698_810_300)).await;
    assert_eq!(place_count(&fx.paper), 1);
    let placed = fx
        .paper
        .calls()
        .into_iter()
        .find_map(|c| match c {
            GatewayCall::Place(order) => Some(order),
            _ => None,
        })
        .expect("bracket placement");
    assert_eq!(placed.book_loss_range.as_deref(), Some("1.00"));
    assert_eq!(placed.book_profit_range.as_deref(), Some("10.00"));

    // Fills come back through the order feed.
    let mut fill = update("ENTRY_LEG", "gspcV2", "NSE_ACME", 0, "1002", "COMPLETE");
    fill.avgprc = Some("100.00".to_string());
    fx.engine.handle_event(order_event(fill)).await;
    let mut armed = update("SL_LEG", "gspcV2", "NSE_ACME", 0, "1003", "TRIGGER_PENDING");
    armed.trgprc = Some("99.00".to_string());
    fx.engine.handle_event(order_event(armed)).await;
    let mut open = update("TARGET_LEG", "gspcV2", "NSE_ACME", 0, "1004", "OPEN");
    open.prc = Some("110.00".to_string());
    fx.engine.handle_event(order_event(open)).await;

    {
        let p = &fx.engine.positions()[0];
        assert_eq!(p.entry_price, Some(100.0));
        assert_eq!(p.sl_price, Some(99.0));
        assert_eq!(p.target_price, Some(110.0));
        assert!(p.is_active());
    }

    // Quote 102: |102 - 99| = 3 > 102 * 1.5% = 1.53, stop trails to 100.95.
    fx.engine.handle_event(quote("22", 102.0, 1_698_810_360)).await;
    let modify = fx
        .paper
        .calls()
        .into_iter()
        .find_map(|c| match c {
            GatewayCall::Modify(m) => Some(m),
            _ => None,
        })
        .expect("trailing stop modify");
    assert_eq!(modify.new_trigger_price.as_deref(), Some("100.95"));
    assert_eq!(fx.engine.positions()[0].sl_price, Some(100.95));

    // Target fills: stop is cancelled, the row closes.
    let mut hit = update("TARGET_LEG", "gspcV2", "NSE_ACME", 0, "1004", "COMPLETE");
    hit.prc = Some("110.00".to_string());
    fx.engine.handle_event(order_event(hit)).await;

    let p = &fx.engine.positions()[0];
    assert_eq!(p.active, ActiveFlag::No);
    assert_eq!(p.target_order_status, Some(OrderStatus::Complete));
    assert_eq!(p.sl_order_status, Some(OrderStatus::Canceled));
    assert!(fx
        .paper
        .calls()
        .iter()
        .any(|c| matches!(c, GatewayCall::Cancel(id) if id == "1003")));
}

/// S2: a sell row whose predicted move has already played out is invalidated
/// on its first quote; no order is placed.
#[tokio::test]
async fn s2_played_out_signal_is_invalid() {
    let mut fx = fixture(ENTRIES_ONE_SELL).await;

    // Sell with target 195 quoted at 190: strength = -1 * (195 - 190) < 0.
    fx.engine.handle_event(quote("44", 190.0, 1_698_810_300)).await;
    assert_eq!(place_count(&fx.paper), 0);
    let p = &fx.engine.positions()[0];
    assert_eq!(p.active, ActiveFlag::No);
    assert_eq!(p.entry_order_status, Some(OrderStatus::Invalid));
    assert_eq!(p.strength, Some(-5.0));
}

/// S3: three rows on the same scrip run independent lifecycles keyed by
/// their table index.
#[tokio::test]
async fn s3_same_scrip_rows_are_independent() {
    let mut fx = fixture(ENTRIES_THREE_MODELS).await;

    // One tick at 100: both buys and the 95-target sell have positive
    // strength, so three brackets go out, one per row.
    fx.engine.handle_event(quote("22", 100.0, 1_698_810_300)).await;
    assert_eq!(place_count(&fx.paper), 3);
    let remarks: Vec<String> = fx
        .paper
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            GatewayCall::Place(order) => Some(order.remarks),
            _ => None,
        })
        .collect();
    assert_eq!(remarks[0], "BO:gspcV2:NSE_ACME:0");
    assert_eq!(remarks[1], "BO:trendV1:NSE_ACME:1");
    assert_eq!(remarks[2], "BO:meanrev:NSE_ACME:2");

    // Arm all three rows.
    for (idx, model) in [(0, "gspcV2"), (1, "trendV1"), (2, "meanrev")] {
        let mut fill = update("ENTRY_LEG", model, "NSE_ACME", idx, &format!("20{}1", idx), "COMPLETE");
        fill.avgprc = Some("100.00".to_string());
        fx.engine.handle_event(order_event(fill)).await;
        let mut armed = update("SL_LEG", model, "NSE_ACME", idx, &format!("20{}2", idx), "TRIGGER_PENDING");
        armed.trgprc = Some(if idx == 2 { "101.00" } else { "99.00" }.to_string());
        fx.engine.handle_event(order_event(armed)).await;
        let mut open = update("TARGET_LEG", model, "NSE_ACME", idx, &format!("20{}3", idx), "OPEN");
        open.prc = Some("105.00".to_string());
        fx.engine.handle_event(order_event(open)).await;
    }

    // SL-HIT on row 1 only.
    let mut sl_hit = update("SL_LEG", "trendV1", "NSE_ACME", 1, "2012", "COMPLETE");
    sl_hit.trgprc = Some("99.00".to_string());
    fx.engine.handle_event(order_event(sl_hit)).await;

    let table = fx.engine.positions();
    assert_eq!(table[1].active, ActiveFlag::No);
    assert_eq!(table[1].target_order_status, Some(OrderStatus::Canceled));
    assert!(table[0].is_active(), "row 0 must be untouched");
    assert!(table[2].is_active(), "row 2 must be untouched");
    assert_eq!(table[0].sl_order_status, Some(OrderStatus::TriggerPending));
}

/// S4: the loader hydrates a row from an existing open bracket.
#[tokio::test]
async fn s4_loader_hydrates_open_bracket() {
    let mut entry = OrderMsg {
        order_no: "3001".to_string(),
        status: "COMPLETE".to_string(),
        remarks: Some("ENTRY_LEG:gspcV2:NSE_ACME:0".to_string()),
        product: Some("B".to_string()),
        ..Default::default()
    };
    entry.avgprc = Some("101.00".to_string());
    let mut sl = entry.clone();
    sl.order_no = "3002".to_string();
    sl.status = "TRIGGER_PENDING".to_string();
    sl.remarks = Some("SL_LEG:gspcV2:NSE_ACME:0".to_string());
    sl.avgprc = None;
    sl.trgprc = Some("99.95".to_string());
    let mut target = entry.clone();
    target.order_no = "3003".to_string();
    target.status = "OPEN".to_string();
    target.remarks = Some("TARGET_LEG:gspcV2:NSE_ACME:0".to_string());
    target.avgprc = None;
    target.prc = Some("110.00".to_string());

    let fx = fixture_with_book(ENTRIES_ONE_BUY, Some(vec![entry, sl, target])).await;
    let p = &fx.engine.positions()[0];
    assert_eq!(p.active, ActiveFlag::Yes);
    assert_eq!(p.entry_order_id.as_deref(), Some("3001"));
    assert_eq!(p.sl_order_id.as_deref(), Some("3002"));
    assert_eq!(p.target_order_id.as_deref(), Some("3003"));
    assert_eq!(p.sl_price, Some(99.95));
    assert_eq!(p.target_price, Some(110.0));
    // strength = |target - entry_price|
    assert_eq!(p.strength, Some(9.0));
}

/// S5: the cutoff flattens a still-active row; the persisted params show it
/// closed with the target leg cancelled.
#[tokio::test]
async fn s5_cutoff_flattens_and_persists() {
    let mut fx = fixture(ENTRIES_ONE_BUY).await;
    fx.engine.handle_event(quote("22", 100.0, 1_698_810_300)).await;
    let mut fill = update("ENTRY_LEG", "gspcV2", "NSE_ACME", 0, "1002", "COMPLETE");
    fill.avgprc = Some("100.00".to_string());
    fx.engine.handle_event(order_event(fill)).await;
    let mut armed = update("SL_LEG", "gspcV2", "NSE_ACME", 0, "1003", "TRIGGER_PENDING");
    armed.trgprc = Some("99.00".to_string());
    fx.engine.handle_event(order_event(armed)).await;
    let mut open = update("TARGET_LEG", "gspcV2", "NSE_ACME", 0, "1004", "OPEN");
    open.prc = Some("110.00".to_string());
    fx.engine.handle_event(order_event(open)).await;

    let keep_running = fx.engine.handle_event(EngineEvent::Flatten).await;
    assert!(!keep_running);

    // The stop leg was converted to a market exit, the target cancelled.
    let calls = fx.paper.calls();
    assert!(calls.iter().any(|c| matches!(
        c,
        GatewayCall::Modify(m)
            if m.order_no == "1003"
                && m.new_price_type == bracketbot::broker::types::PriceType::Market
    )));
    assert!(calls
        .iter()
        .any(|c| matches!(c, GatewayCall::Cancel(id) if id == "1004")));

    // Persist the frozen table and read it back: no Y rows survive.
    fx.log
        .log_params("ACCT", "2023-11-01", STAGE_PRE_COB, fx.engine.positions())
        .unwrap();
    let stored = fx.log.load_params("ACCT", "2023-11-01", STAGE_PRE_COB).unwrap();
    assert!(stored.iter().all(|p| p.active == ActiveFlag::No));
    assert_eq!(stored[0].target_order_status, Some(OrderStatus::Canceled));
    assert!(stored[0].target_ts.is_some());
}

/// S6: a null placement response leaves the placeholder id in place and the
/// engine never re-attempts on later ticks.
#[tokio::test]
async fn s6_null_placement_blocks_reattempts() {
    let mut fx = fixture(ENTRIES_ONE_BUY).await;
    // The retry decorator re-logs-in and retries once; both calls fail.
    fx.paper.fail_next_places(2);

    fx.engine.handle_event(quote("22", 100.0, 1_698_810_300)).await;
    assert_eq!(place_count(&fx.paper), 2);
    assert_eq!(
        fx.engine.positions()[0].entry_order_id.as_deref(),
        Some(ENTRY_PLACEHOLDER)
    );

    fx.engine.handle_event(quote("22", 100.5, 1_698_810_301)).await;
    fx.engine.handle_event(quote("22", 101.0, 1_698_810_302)).await;
    assert_eq!(place_count(&fx.paper), 2, "no further placements");
    assert_eq!(fx.paper.login_count(), 1, "exactly one re-login");
}

/// Replay law: the same event stream applied to a fresh table reproduces the
/// final snapshot byte-for-byte (timestamps pinned via exchange time).
#[tokio::test]
async fn replaying_the_event_stream_reproduces_the_snapshot() {
    fn events() -> Vec<EngineEvent> {
        let mut fill = update("ENTRY_LEG", "gspcV2", "NSE_ACME", 0, "1002", "COMPLETE");
        fill.avgprc = Some("100.00".to_string());
        let mut armed = update("SL_LEG", "gspcV2", "NSE_ACME", 0, "1003", "TRIGGER_PENDING");
        armed.trgprc = Some("99.00".to_string());
        let mut open = update("TARGET_LEG", "gspcV2", "NSE_ACME", 0, "1004", "OPEN");
        open.prc = Some("110.00".to_string());
        let mut hit = update("SL_LEG", "gspcV2", "NSE_ACME", 0, "1003", "COMPLETE");
        hit.trgprc = Some("99.00".to_string());
        vec![
            quote("22", 100.0, 1_698_810_300),
            order_event(fill),
            order_event(armed),
            order_event(open),
            quote("22", 102.0, 1_698_810_360),
            order_event(hit),
        ]
    }

    async fn run(entries: &'static str) -> Vec<Position> {
        let mut fx = fixture(entries).await;
        for event in events() {
            fx.engine.handle_event(event).await;
        }
        fx.engine.positions().to_vec()
    }

    let first: Vec<Position> = run(ENTRIES_ONE_BUY).await;
    let second: Vec<Position> = run(ENTRIES_ONE_BUY).await;

    let a = serde_json::to_string(&first).unwrap();
    let b = serde_json::to_string(&second).unwrap();
    assert_eq!(a, b, "replay must be deterministic");

    // And the final state is the SL-HIT outcome.
    assert_eq!(first[0].active, ActiveFlag::No);
    assert_eq!(first[0].sl_order_status, Some(OrderStatus::Complete));
    assert_eq!(first[0].target_order_status, Some(OrderStatus::Canceled));
}

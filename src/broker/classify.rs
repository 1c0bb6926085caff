//! Order classifier: maps raw broker messages onto the engine's three-leg
//! model and a logical status.
//!
//! The `remarks` tag `"<LEG>:<model>:<scrip>:<index>"` is the authoritative
//! correlation handle; native-bracket rows that carry only the parent/child id
//! scheme are classified from the child-order fields instead. Messages with
//! neither are skipped by the caller.

use crate::broker::types::OrderMsg;
use crate::models::OrderStatus;

pub const ENTRY_LEG_TAG: &str = "ENTRY_LEG";
pub const SL_LEG_TAG: &str = "SL_LEG";
pub const TARGET_LEG_TAG: &str = "TARGET_LEG";

/// Which of the three orders making up a position this message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegKind {
    Entry,
    StopLoss,
    Target,
}

impl LegKind {
    pub fn tag(self) -> &'static str {
        match self {
            LegKind::Entry => ENTRY_LEG_TAG,
            LegKind::StopLoss => SL_LEG_TAG,
            LegKind::Target => TARGET_LEG_TAG,
        }
    }
}

/// Leg type plus native status condensed into the lifecycle event the engine
/// acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalStatus {
    EntryFilled,
    SlHit,
    TargetHit,
    SlArmed,
    TargetArmed,
    Rejected(String),
    Canceled,
    /// Any other leg/status pairing; recorded verbatim.
    Native(OrderStatus),
}

/// Fully classified broker message.
#[derive(Debug, Clone)]
pub struct Classified {
    pub leg: LegKind,
    /// Position table index recovered from `remarks`; `None` on the pure
    /// parent/child path, where the caller resolves the row by order id.
    pub index: Option<usize>,
    pub status: LogicalStatus,
    /// The broker-native status, for recording on the position row.
    pub native: OrderStatus,
}

/// Build the engine's correlation tag for one leg of one position.
pub fn leg_remarks(leg: LegKind, model: &str, scrip: &str, index: usize) -> String {
    [leg.tag(), model, scrip, &index.to_string()].join(":")
}

/// Leg type of a message, `remarks` tag first, bracket child fields second.
pub fn leg_kind(msg: &OrderMsg) -> Option<LegKind> {
    if let Some(leg) = leg_from_remarks(msg) {
        return Some(leg);
    }
    if msg.is_bracket() {
        // The bracket parent has no child-order number; children carry the
        // type flag ("1" = stop-loss).
        return Some(match msg.child_order_no.as_deref() {
            None | Some("") => LegKind::Entry,
            Some(_) => {
                if msg.child_order_type.as_deref() == Some("1") {
                    LegKind::StopLoss
                } else {
                    LegKind::Target
                }
            }
        });
    }
    None
}

fn leg_from_remarks(msg: &OrderMsg) -> Option<LegKind> {
    let remarks = msg.remarks.as_deref()?;
    match remarks.split(':').next()? {
        ENTRY_LEG_TAG => Some(LegKind::Entry),
        SL_LEG_TAG => Some(LegKind::StopLoss),
        TARGET_LEG_TAG => Some(LegKind::Target),
        _ => None,
    }
}

/// Position index from the trailing `remarks` segment.
pub fn order_index(msg: &OrderMsg) -> Option<usize> {
    let remarks = msg.remarks.as_deref()?;
    if !remarks.contains(':') {
        return None;
    }
    remarks.rsplit(':').next()?.trim().parse::<usize>().ok()
}

/// Classify a message; `None` when it carries neither a leg tag nor bracket
/// child fields and therefore cannot belong to this engine.
pub fn classify(msg: &OrderMsg) -> Option<Classified> {
    let leg = leg_kind(msg)?;
    let native = OrderStatus::parse(&msg.status)?;
    let status = match (leg, native) {
        (LegKind::Entry, OrderStatus::Complete) => LogicalStatus::EntryFilled,
        (LegKind::StopLoss, OrderStatus::Complete) => LogicalStatus::SlHit,
        (LegKind::Target, OrderStatus::Complete) => LogicalStatus::TargetHit,
        (LegKind::StopLoss, OrderStatus::TriggerPending) => LogicalStatus::SlArmed,
        (LegKind::Target, OrderStatus::Open) => LogicalStatus::TargetArmed,
        (_, OrderStatus::Rejected) => LogicalStatus::Rejected(
            msg.reject_reason.clone().unwrap_or_else(|| "NA".to_string()),
        ),
        (_, OrderStatus::Canceled) => LogicalStatus::Canceled,
        (_, other) => LogicalStatus::Native(other),
    };
    Some(Classified {
        leg,
        index: order_index(msg),
        status,
        native,
    })
}

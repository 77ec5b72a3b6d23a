use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instrument::Instrument;

/// Signal kinds accepted on the webhook. `EodMonitor` is accepted and logged
/// but never executed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    BaseEntry,
    Pyramid,
    Exit,
    EodMonitor,
}

impl SignalKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            SignalKind::BaseEntry => "BASE_ENTRY",
            SignalKind::Pyramid => "PYRAMID",
            SignalKind::Exit => "EXIT",
            SignalKind::EodMonitor => "EOD_MONITOR",
        }
    }

    fn from_wire(s: &str) -> Option<SignalKind> {
        match s {
            "BASE_ENTRY" => Some(SignalKind::BaseEntry),
            "PYRAMID" => Some(SignalKind::Pyramid),
            "EXIT" => Some(SignalKind::Exit),
            "EOD_MONITOR" => Some(SignalKind::EodMonitor),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Position slot tag carried by the strategy ("Long_1", "Long_2", ...).
/// `All` is only meaningful on EXIT signals.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    All,
    Named(String),
}

impl Slot {
    pub fn from_wire(s: &str) -> Slot {
        if s.eq_ignore_ascii_case("ALL") {
            Slot::All
        } else {
            Slot::Named(s.to_string())
        }
    }

    pub fn wire_name(&self) -> &str {
        match self {
            Slot::All => "ALL",
            Slot::Named(s) => s,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A decoded trading directive. Parsed from webhook JSON, fingerprinted,
/// consumed exactly once; only the fingerprint and the processing result
/// outlive it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub instrument: Instrument,
    pub slot: Slot,
    /// Entry (or exit) reference price from the strategy.
    pub price: f64,
    /// Initial protective level.
    pub stop: f64,
    /// Advisory lot count from the strategy; the sizer decides the real one.
    pub suggested_lots: i64,
    pub atr: f64,
    /// Efficiency ratio in [0, 1].
    pub er: f64,
    pub supertrend: f64,
    pub roc: Option<f64>,
    /// Present on EXIT signals only.
    pub exit_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// EOD monitoring payload: accepted, logged, never executed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EodMonitor {
    pub instrument: Instrument,
    pub conditions: Value,
    pub indicators: Value,
    pub position_status: Option<String>,
    pub sizing: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Result of decoding one webhook body.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedWebhook {
    Trading(Signal),
    Monitor(EodMonitor),
}

/// Contract violation in a webhook payload. Carries the offending field so
/// the 400 response can name it. Never retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalParseError {
    pub field: &'static str,
    pub problem: String,
}

impl SignalParseError {
    fn missing(field: &'static str) -> Self {
        Self {
            field,
            problem: "missing required field".to_string(),
        }
    }

    fn bad(field: &'static str, problem: impl Into<String>) -> Self {
        Self {
            field,
            problem: problem.into(),
        }
    }
}

impl fmt::Display for SignalParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field `{}`: {}", self.field, self.problem)
    }
}

impl std::error::Error for SignalParseError {}

fn str_field<'a>(body: &'a Value, field: &'static str) -> Result<&'a str, SignalParseError> {
    body.get(field)
        .ok_or_else(|| SignalParseError::missing(field))?
        .as_str()
        .ok_or_else(|| SignalParseError::bad(field, "expected a string"))
}

fn num_field(body: &Value, field: &'static str) -> Result<f64, SignalParseError> {
    body.get(field)
        .ok_or_else(|| SignalParseError::missing(field))?
        .as_f64()
        .ok_or_else(|| SignalParseError::bad(field, "expected a number"))
}

fn opt_num_field(body: &Value, field: &'static str) -> Result<Option<f64>, SignalParseError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| SignalParseError::bad(field, "expected a number")),
    }
}

fn timestamp_field(body: &Value, field: &'static str) -> Result<DateTime<Utc>, SignalParseError> {
    let raw = str_field(body, field)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SignalParseError::bad(field, format!("not ISO-8601 UTC: {e}")))
}

/// Decode one webhook JSON body into a [`ParsedWebhook`].
///
/// Field-presence and type errors are [`SignalParseError`] (HTTP 400 with the
/// field named). Value-range and logical checks live in ppm-validate, not
/// here: parse answers "is this the contract shape", validation answers "is
/// this directive sane".
pub fn parse_webhook(body: &Value) -> Result<ParsedWebhook, SignalParseError> {
    let kind_raw = str_field(body, "type")?;
    let kind = SignalKind::from_wire(kind_raw)
        .ok_or_else(|| SignalParseError::bad("type", format!("unknown signal type `{kind_raw}`")))?;

    let instrument_raw = str_field(body, "instrument")?;
    let instrument = Instrument::from_wire(instrument_raw).ok_or_else(|| {
        SignalParseError::bad("instrument", format!("unknown instrument `{instrument_raw}`"))
    })?;

    let timestamp = timestamp_field(body, "timestamp")?;

    if kind == SignalKind::EodMonitor {
        let conditions = body
            .get("conditions")
            .cloned()
            .ok_or_else(|| SignalParseError::missing("conditions"))?;
        let indicators = body
            .get("indicators")
            .cloned()
            .ok_or_else(|| SignalParseError::missing("indicators"))?;
        return Ok(ParsedWebhook::Monitor(EodMonitor {
            instrument,
            conditions,
            indicators,
            position_status: body
                .get("position_status")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            sizing: body.get("sizing").cloned(),
            timestamp,
        }));
    }

    let slot = Slot::from_wire(str_field(body, "position")?);
    if slot == Slot::All && kind != SignalKind::Exit {
        return Err(SignalParseError::bad("position", "ALL is only valid on EXIT"));
    }

    // `lots` and `suggested_lots` are both seen in the wild; prefer the
    // explicit name when present.
    let suggested_lots = match body.get("suggested_lots").or_else(|| body.get("lots")) {
        Some(v) => v
            .as_i64()
            .ok_or_else(|| SignalParseError::bad("lots", "expected an integer"))?,
        None => 0,
    };

    let exit_reason = body
        .get("reason")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    if kind == SignalKind::Exit && exit_reason.is_none() {
        return Err(SignalParseError::missing("reason"));
    }

    Ok(ParsedWebhook::Trading(Signal {
        kind,
        instrument,
        slot,
        price: num_field(body, "price")?,
        stop: num_field(body, "stop")?,
        suggested_lots,
        atr: num_field(body, "atr")?,
        er: num_field(body, "er")?,
        supertrend: num_field(body, "supertrend")?,
        roc: opt_num_field(body, "roc")?,
        exit_reason,
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_entry_body() -> Value {
        json!({
            "type": "BASE_ENTRY",
            "instrument": "BANK_NIFTY",
            "position": "Long_1",
            "price": 52000.0,
            "stop": 51650.0,
            "lots": 3,
            "atr": 350.0,
            "er": 0.82,
            "supertrend": 51500.0,
            "timestamp": "2025-07-14T09:32:05Z"
        })
    }

    #[test]
    fn parses_base_entry() {
        let parsed = parse_webhook(&base_entry_body()).expect("valid payload");
        match parsed {
            ParsedWebhook::Trading(s) => {
                assert_eq!(s.kind, SignalKind::BaseEntry);
                assert_eq!(s.instrument, Instrument::BankNifty);
                assert_eq!(s.slot, Slot::Named("Long_1".into()));
                assert_eq!(s.suggested_lots, 3);
                assert_eq!(s.exit_reason, None);
            }
            other => panic!("expected trading signal, got {other:?}"),
        }
    }

    #[test]
    fn missing_price_names_the_field() {
        let mut body = base_entry_body();
        body.as_object_mut().unwrap().remove("price");
        let err = parse_webhook(&body).unwrap_err();
        assert_eq!(err.field, "price");
    }

    #[test]
    fn string_price_is_a_type_error() {
        let mut body = base_entry_body();
        body["price"] = json!("fifty-two thousand");
        let err = parse_webhook(&body).unwrap_err();
        assert_eq!(err.field, "price");
        assert!(err.problem.contains("number"));
    }

    #[test]
    fn exit_requires_reason() {
        let mut body = base_entry_body();
        body["type"] = json!("EXIT");
        body["position"] = json!("ALL");
        let err = parse_webhook(&body).unwrap_err();
        assert_eq!(err.field, "reason");
    }

    #[test]
    fn all_slot_rejected_outside_exit() {
        let mut body = base_entry_body();
        body["position"] = json!("ALL");
        let err = parse_webhook(&body).unwrap_err();
        assert_eq!(err.field, "position");
    }

    #[test]
    fn bad_timestamp_rejected() {
        let mut body = base_entry_body();
        body["timestamp"] = json!("last tuesday");
        let err = parse_webhook(&body).unwrap_err();
        assert_eq!(err.field, "timestamp");
    }

    #[test]
    fn eod_monitor_parses_without_trading_fields() {
        let body = json!({
            "type": "EOD_MONITOR",
            "instrument": "GOLD_MINI",
            "conditions": {"c1": true},
            "indicators": {"atr": 120.5},
            "position_status": "holding",
            "timestamp": "2025-07-14T09:45:00Z"
        });
        match parse_webhook(&body).expect("valid monitor payload") {
            ParsedWebhook::Monitor(m) => {
                assert_eq!(m.instrument, Instrument::GoldMini);
                assert_eq!(m.position_status.as_deref(), Some("holding"));
            }
            other => panic!("expected monitor, got {other:?}"),
        }
    }
}

//! JSON request/response layer. One request per line:
//!
//! ```text
//! {"id": 1, "caller": 10, "token": "...", "function": "book_reservation",
//!  "args": {"slotid": "01J...", "date": "2026-10-26"}}
//! ```
//!
//! answered by `{"id": 1, "ok": ...}` or `{"id": 1, "error": {"code", "message"}}`.

use std::time::Instant;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Instrument;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{CourseId, SlotPatch, UserId, Weekday};
use crate::observability;

#[derive(Debug)]
pub enum RpcError {
    /// Not a JSON request object.
    Malformed(String),
    Unauthenticated,
    /// Unknown function or arguments that don't fit it.
    InvalidParams(String),
    Engine(EngineError),
    Encode(String),
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Malformed(_) => "malformed_request",
            RpcError::Unauthenticated => "unauthenticated",
            RpcError::InvalidParams(_) => "invalid_params",
            RpcError::Engine(e) => e.code(),
            RpcError::Encode(_) => "internal_error",
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Malformed(e) => write!(f, "malformed request: {e}"),
            RpcError::Unauthenticated => write!(f, "invalid service token"),
            RpcError::InvalidParams(e) => write!(f, "invalid params: {e}"),
            RpcError::Engine(e) => write!(f, "{e}"),
            RpcError::Encode(e) => write!(f, "failed to encode result: {e}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<EngineError> for RpcError {
    fn from(e: EngineError) -> Self {
        RpcError::Engine(e)
    }
}

fn default_true() -> bool {
    true
}

/// Every callable function with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum Function {
    CreateSlot {
        startunit: u32,
        duration: u32,
        weekday: Weekday,
        room: String,
        size: u32,
    },
    UpdateSlot {
        slotid: Ulid,
        #[serde(flatten)]
        patch: SlotPatch,
    },
    DeleteSlot {
        slotid: Ulid,
    },
    GetAllSlots,
    GetMySlots,
    GetStudentSlots {
        userid: UserId,
    },
    GetSupervisorSlots,
    AddSlotFilter {
        slotid: Ulid,
        #[serde(default)]
        courseid: Option<CourseId>,
        #[serde(default)]
        vintage: Option<String>,
    },
    DeleteSlotFilter {
        filterid: Ulid,
    },
    GetSlotFilters {
        slotid: Ulid,
    },
    AddSlotSupervisor {
        slotid: Ulid,
        userid: UserId,
    },
    RemoveSlotSupervisor {
        slotid: Ulid,
        userid: UserId,
    },
    BookReservation {
        slotid: Ulid,
        date: NaiveDate,
        /// Defaults to the caller.
        #[serde(default)]
        userid: Option<UserId>,
    },
    UnbookReservation {
        reservationid: Ulid,
        #[serde(default = "default_true")]
        nice: bool,
        #[serde(default)]
        strict: bool,
    },
    GetSlotReservations {
        slotid: Ulid,
    },
    GetMyReservations,
    Listen,
    Unlisten,
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    #[serde(default)]
    id: Value,
    caller: UserId,
    #[serde(default)]
    token: String,
    function: String,
    #[serde(default)]
    args: Value,
}

/// A decoded, authenticated request.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: Value,
    pub caller: UserId,
    pub function: Function,
}

/// Decode a request line and check its token. Errors carry the request id
/// when it could be read.
pub fn parse(line: &str, token: &str) -> Result<Call, (Value, RpcError)> {
    let raw: RawRequest =
        serde_json::from_str(line).map_err(|e| (Value::Null, RpcError::Malformed(e.to_string())))?;
    if raw.token != token {
        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        return Err((raw.id, RpcError::Unauthenticated));
    }

    let mut fields = match raw.args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => {
            return Err((
                raw.id,
                RpcError::InvalidParams("args must be an object".into()),
            ));
        }
    };
    fields.insert("function".into(), Value::String(raw.function));
    match serde_json::from_value::<Function>(Value::Object(fields)) {
        Ok(function) => Ok(Call {
            id: raw.id,
            caller: raw.caller,
            function,
        }),
        Err(e) => Err((raw.id, RpcError::InvalidParams(e.to_string()))),
    }
}

pub fn ok_response(id: Value, payload: Value) -> Value {
    let mut map = Map::new();
    map.insert("id".into(), id);
    map.insert("ok".into(), payload);
    Value::Object(map)
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

pub fn error_response(id: Value, err: &RpcError) -> Value {
    let body = ErrorBody {
        code: err.code(),
        message: err.to_string(),
    };
    let mut map = Map::new();
    map.insert("id".into(), id);
    map.insert(
        "error".into(),
        serde_json::to_value(body).unwrap_or(Value::Null),
    );
    Value::Object(map)
}

fn encode<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Encode(e.to_string()))
}

/// Record RED metrics for one finished call.
pub fn record(function: &Function, ok: bool, started: Instant) {
    let label = observability::function_label(function);
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(observability::REQUESTS_TOTAL, "function" => label, "status" => status)
        .increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "function" => label)
        .record(started.elapsed().as_secs_f64());
}

/// Run one call against the engine inside an `rpc` span.
pub async fn invoke(engine: &Engine, caller: UserId, function: Function) -> Result<Value, RpcError> {
    let span = tracing::info_span!(
        "rpc",
        function = observability::function_label(&function),
        caller
    );
    let started = Instant::now();
    let result = dispatch(engine, caller, function.clone()).instrument(span).await;
    record(&function, result.is_ok(), started);
    result
}

async fn dispatch(engine: &Engine, caller: UserId, function: Function) -> Result<Value, RpcError> {
    match function {
        Function::CreateSlot {
            startunit,
            duration,
            weekday,
            room,
            size,
        } => encode(
            engine
                .create_slot(startunit, duration, weekday, room, size, caller)
                .await?,
        ),
        Function::UpdateSlot { slotid, patch } => {
            encode(engine.update_slot(slotid, patch, caller).await?)
        }
        Function::DeleteSlot { slotid } => {
            engine.delete_slot(slotid, caller).await?;
            Ok(Value::Null)
        }
        Function::GetAllSlots => encode(engine.get_all_slots(caller).await?),
        Function::GetMySlots => encode(engine.get_my_slots(caller).await?),
        Function::GetStudentSlots { userid } => {
            encode(engine.get_student_slots(caller, userid).await?)
        }
        Function::GetSupervisorSlots => encode(engine.get_supervisor_slots(caller).await?),
        Function::AddSlotFilter {
            slotid,
            courseid,
            vintage,
        } => encode(engine.add_filter(slotid, courseid, vintage, caller).await?),
        Function::DeleteSlotFilter { filterid } => {
            engine.remove_filter(filterid, caller).await?;
            Ok(Value::Null)
        }
        Function::GetSlotFilters { slotid } => encode(engine.get_filters(slotid, caller).await?),
        Function::AddSlotSupervisor { slotid, userid } => {
            engine.add_supervisor(slotid, userid, caller).await?;
            Ok(Value::Null)
        }
        Function::RemoveSlotSupervisor { slotid, userid } => {
            engine.remove_supervisor(slotid, userid, caller).await?;
            Ok(Value::Null)
        }
        Function::BookReservation {
            slotid,
            date,
            userid,
        } => encode(
            engine
                .book_reservation(slotid, date, userid.unwrap_or(caller), caller)
                .await?,
        ),
        Function::UnbookReservation {
            reservationid,
            nice,
            strict,
        } => encode(
            engine
                .unbook_reservation(reservationid, caller, !nice, strict)
                .await?,
        ),
        Function::GetSlotReservations { slotid } => {
            encode(engine.get_slot_reservations(slotid, caller).await?)
        }
        Function::GetMyReservations => encode(engine.get_my_reservations(caller).await?),
        // Subscriptions belong to the connection, which handles them itself.
        Function::Listen | Function::Unlisten => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_book_reservation() {
        let call = parse(
            r#"{"id": 7, "caller": 10, "token": "t", "function": "book_reservation",
                "args": {"slotid": "01ARZ3NDEKTSV4RRFFQ69G5FAV", "date": "2026-10-26"}}"#,
            "t",
        )
        .unwrap();
        assert_eq!(call.id, Value::from(7));
        assert_eq!(call.caller, 10);
        assert_eq!(
            call.function,
            Function::BookReservation {
                slotid: "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap(),
                date: NaiveDate::from_ymd_opt(2026, 10, 26).unwrap(),
                userid: None,
            }
        );
    }

    #[test]
    fn functions_without_args() {
        let call = parse(r#"{"caller": 1, "token": "t", "function": "get_my_slots"}"#, "t").unwrap();
        assert_eq!(call.function, Function::GetMySlots);
        assert_eq!(call.id, Value::Null);

        let call = parse(
            r#"{"caller": 1, "token": "t", "function": "listen", "args": {}}"#,
            "t",
        )
        .unwrap();
        assert_eq!(call.function, Function::Listen);
    }

    #[test]
    fn unbook_defaults_to_nice() {
        let call = parse(
            r#"{"caller": 1, "token": "t", "function": "unbook_reservation",
                "args": {"reservationid": "01ARZ3NDEKTSV4RRFFQ69G5FAV"}}"#,
            "t",
        )
        .unwrap();
        assert!(matches!(
            call.function,
            Function::UnbookReservation {
                nice: true,
                strict: false,
                ..
            }
        ));
    }

    #[test]
    fn update_slot_patch_is_flattened() {
        let call = parse(
            r#"{"caller": 1, "token": "t", "function": "update_slot",
                "args": {"slotid": "01ARZ3NDEKTSV4RRFFQ69G5FAV", "size": 3, "weekday": 5}}"#,
            "t",
        )
        .unwrap();
        let Function::UpdateSlot { patch, .. } = call.function else {
            panic!("expected update_slot");
        };
        assert_eq!(patch.capacity, Some(3));
        assert_eq!(patch.weekday, Some(Weekday::Friday));
        assert_eq!(patch.room, None);
    }

    #[test]
    fn wrong_token_keeps_request_id() {
        let (id, err) = parse(
            r#"{"id": "a", "caller": 1, "token": "nope", "function": "get_my_slots"}"#,
            "t",
        )
        .unwrap_err();
        assert_eq!(id, Value::from("a"));
        assert_eq!(err.code(), "unauthenticated");
    }

    #[test]
    fn bad_requests() {
        let (_, err) = parse("not json", "t").unwrap_err();
        assert_eq!(err.code(), "malformed_request");

        let (_, err) = parse(
            r#"{"caller": 1, "token": "t", "function": "launch_rockets"}"#,
            "t",
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_params");

        let (_, err) = parse(
            r#"{"caller": 1, "token": "t", "function": "create_slot",
                "args": {"startunit": 1, "duration": 1, "weekday": 1, "room": "R1", "size": -1}}"#,
            "t",
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_params");

        let (_, err) = parse(
            r#"{"caller": 1, "token": "t", "function": "delete_slot", "args": [1]}"#,
            "t",
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_params");
    }

    #[test]
    fn response_shapes() {
        let ok = ok_response(Value::from(1), Value::from("x"));
        assert_eq!(ok["id"], 1);
        assert_eq!(ok["ok"], "x");

        let err = error_response(
            Value::from(2),
            &RpcError::Engine(EngineError::TooFarInFuture { max_days: 7 }),
        );
        assert_eq!(err["id"], 2);
        assert_eq!(err["error"]["code"], "too_far_in_future");
        assert!(err["error"]["message"].as_str().unwrap().contains("7 days"));
    }
}

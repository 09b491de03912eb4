//! Tagged decode of JSON-RPC shaped objects.
//!
//! A parsed object is classified exactly once, at observation time, so the
//! rest of the crate matches on variants instead of probing fields.

use serde_json::{Map, Value};

use crate::net::connection::Side;

/// Worker login. First parameter is the worker name.
pub const AUTHORIZE: &str = "mining.authorize";
/// Share submission.
pub const SUBMIT: &str = "mining.submit";
/// Pool-pushed difficulty change. First parameter is the new difficulty.
pub const SET_DIFFICULTY: &str = "mining.set_difficulty";

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
    /// A JSON object matching none of the shapes above.
    Unrecognized(Map<String, Value>),
}

/// A call expecting a response (`method` + non-null `id`).
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

/// A reply (`id` + `result` and/or `error`).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

/// A one-way message (`method` with no id, or pushed by the upstream).
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Message {
    /// Classify a JSON object observed on bytes arriving from `origin`.
    ///
    /// Anything carrying a `method` that comes from the upstream is a
    /// notification even when it has an id: pools attach ids to pushes such
    /// as `mining.set_difficulty`. Responses only come from the upstream; a
    /// miner answering a pool-initiated call (`client.get_version`) is left
    /// unrecognized so it never pairs with the miner's own requests.
    pub fn classify(mut object: Map<String, Value>, origin: Side) -> Self {
        let id = object.get("id").cloned().unwrap_or(Value::Null);

        if let Some(Value::String(method)) = object.get("method") {
            let method = method.clone();
            let params = object.remove("params").unwrap_or(Value::Null);
            if id.is_null() || origin == Side::Upstream {
                return Message::Notification(Notification { method, params });
            }
            return Message::Request(Request { id, method, params });
        }

        if origin == Side::Upstream
            && object.contains_key("id")
            && (object.contains_key("result") || object.contains_key("error"))
        {
            return Message::Response(Response {
                id,
                result: object.remove("result").unwrap_or(Value::Null),
                error: object.remove("error").unwrap_or(Value::Null),
            });
        }

        Message::Unrecognized(object)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Notification(_) => "notification",
            Message::Unrecognized(_) => "unrecognized",
        }
    }
}

/// Key used to pair a request with its response. Null ids never pair.
fn correlation_key(id: &Value) -> Option<String> {
    (!id.is_null()).then(|| id.to_string())
}

fn first_param(params: &Value) -> Option<&Value> {
    params.as_array().and_then(|p| p.first())
}

impl Request {
    pub fn correlation_key(&self) -> Option<String> {
        correlation_key(&self.id)
    }

    pub fn is_submit(&self) -> bool {
        self.method == SUBMIT
    }

    /// Worker name carried by an authorization request, if non-empty.
    pub fn worker_name(&self) -> Option<&str> {
        if self.method != AUTHORIZE {
            return None;
        }
        first_param(&self.params)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }
}

impl Response {
    pub fn correlation_key(&self) -> Option<String> {
        correlation_key(&self.id)
    }

    /// Accepted unless an error is present or the result is literally `false`.
    pub fn is_accepted(&self) -> bool {
        self.error.is_null() && self.result != Value::Bool(false)
    }
}

impl Notification {
    /// New difficulty from a `mining.set_difficulty` push.
    pub fn difficulty(&self) -> Option<f64> {
        if self.method != SET_DIFFICULTY {
            return None;
        }
        first_param(&self.params).and_then(Value::as_f64)
    }
}

//! Output formatting utilities for the CLI.
//!
//! Every command prints one JSON object with an `ok` field to stdout. Logs
//! go to stderr so the payload stays machine-readable.

use serde::Serialize;
use serde_json::{json, Value};

/// Exit code for success.
pub const EXIT_OK: i32 = 0;
/// Exit code for operational errors (I/O, bad config, unreachable tools).
pub const EXIT_ERROR: i32 = 1;
/// Exit code when a policy or verification check said no.
pub const EXIT_DENIED: i32 = 2;

/// Result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub ok: bool,
    pub body: Value,
}

impl CommandOutput {
    pub fn success(body: impl Serialize) -> Self {
        Self::new(true, body)
    }

    pub fn denied(body: impl Serialize) -> Self {
        Self::new(false, body)
    }

    pub fn new(ok: bool, body: impl Serialize) -> Self {
        let body = serde_json::to_value(body).unwrap_or_else(|e| json!({"serialization_error": e.to_string()}));
        Self { ok, body }
    }

    /// The payload with `ok` merged in. Non-object bodies go under `result`.
    pub fn to_json(&self) -> Value {
        let mut object = match &self.body {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("result".to_string(), other.clone());
                map
            }
        };
        object.insert("ok".to_string(), Value::Bool(self.ok));
        Value::Object(object)
    }

    pub fn exit_code(&self) -> i32 {
        if self.ok {
            EXIT_OK
        } else {
            EXIT_DENIED
        }
    }
}

pub fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Print a command result and return its exit code.
pub fn emit(output: &CommandOutput) -> i32 {
    print_json(&output.to_json());
    output.exit_code()
}

/// Print an operational error and return the error exit code.
pub fn emit_error(err: &anyhow::Error) -> i32 {
    let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
    print_json(&json!({
        "ok": false,
        "error": err.to_string(),
        "causes": chain.get(1..).unwrap_or_default(),
    }));
    EXIT_ERROR
}

//! Sandbox probe used to exercise the capability layer end to end.

use std::time::Duration;

use serde_json::{json, Value};

use crate::{input_str, Capabilities, PluginError, RunContext};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub fn spec(name: &str, network_access: bool) -> Value {
    json!({
        "name": name,
        "description": "Try a filesystem write or an outbound connection through the sandbox.",
        "version": "0.1.0",
        "network_access": network_access,
        "keywords": ["sandbox", "probe"],
        "input_schema": {
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["write", "connect"]},
                "path": {"type": "string"},
                "content": {"type": "string"},
                "addr": {"type": "string"}
            },
            "required": ["action"]
        }
    })
}

/// `write` takes `path` and optional `content`; `connect` takes `addr` (host:port).
pub fn handle(input: Value, _context: &RunContext, caps: &Capabilities) -> Result<Value, PluginError> {
    match input_str(&input, "action")? {
        "write" => {
            let path = input_str(&input, "path")?;
            let content = input.get("content").and_then(Value::as_str).unwrap_or("probe\n");
            caps.fs().write(path, content.as_bytes())?;
            Ok(json!({"written": path, "bytes": content.len()}))
        }
        "connect" => {
            let addr = input_str(&input, "addr")?;
            caps.net().connect(addr, CONNECT_TIMEOUT)?;
            Ok(json!({"connected": addr}))
        }
        other => Err(PluginError::Input(format!("unknown action '{other}'"))),
    }
}

use serde_json::{json, Value};
use tether_plugin::input_str;

fn main() {
    let spec = json!({
        "name": "echo",
        "description": "Echo the given text back.",
        "version": "0.1.0",
        "keywords": ["echo", "repeat"],
        "input_schema": {
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }
    });
    tether_plugin::main(spec, |input: Value, _, _| {
        let text = input_str(&input, "text")?;
        Ok(json!({"echo": text}))
    })
}

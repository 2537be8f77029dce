//! Last check on outgoing Codex bodies, over raw JSON.
//!
//! Does not rely on the typed transformer having run: whatever reaches the
//! upstream has no item references and no item ids in `input`.

use serde_json::Value;

fn is_item_reference(item: &Value) -> bool {
    item.get("type").and_then(Value::as_str) == Some("item_reference")
}

/// Strip item references and item ids from a serialized request body.
///
/// Text that is not JSON comes back exactly as given. Only `input` is
/// touched; `previousResponseId` and `previous_response_id` are left alone.
pub fn sanitize_request_text(text: &str) -> String {
    let Ok(mut body) = serde_json::from_str::<Value>(text) else {
        return text.to_string();
    };

    let Some(Value::Array(items)) = body.get_mut("input") else {
        return serde_json::to_string(&body).unwrap_or_else(|_| text.to_string());
    };

    let before = items.len();
    items.retain(|item| !is_item_reference(item));
    let mut stripped = 0usize;
    for item in items.iter_mut() {
        if let Some(object) = item.as_object_mut() {
            if object.shift_remove("id").is_some() {
                stripped += 1;
            }
        }
    }
    if before != items.len() || stripped > 0 {
        tracing::debug!(
            references = before - items.len(),
            ids = stripped,
            "safety net removed stateful fields"
        );
    }

    serde_json::to_string(&body).unwrap_or_else(|_| text.to_string())
}

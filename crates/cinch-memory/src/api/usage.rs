//! Usage-block parsing shared by both HTTP clients.
//!
//! Chat completions report `prompt_tokens` / `completion_tokens`; the
//! Responses API reports `input_tokens` / `output_tokens` with detail
//! objects. Both shapes map onto one [`UsageReport`].

use crate::ledger::UsageReport;
use serde_json::Value;

fn int_field(obj: &Value, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

/// Extract usage from a full provider response body.
///
/// `total` falls back to `input + output`, then to `prompt + completion`.
/// A sum that overflows `i64` counts as missing.
/// Missing `input`/`output` fall back to `prompt`/`completion`.
pub fn usage_from_payload(body: &Value) -> UsageReport {
    let Some(usage) = body.get("usage").filter(|u| u.is_object()) else {
        return UsageReport::default();
    };

    let mut input = int_field(usage, "input_tokens");
    let mut output = int_field(usage, "output_tokens");
    let mut total = int_field(usage, "total_tokens");

    if total.is_none()
        && let (Some(i), Some(o)) = (input, output)
    {
        total = i.checked_add(o);
    }
    let prompt = int_field(usage, "prompt_tokens");
    let completion = int_field(usage, "completion_tokens");
    if total.is_none()
        && let (Some(p), Some(c)) = (prompt, completion)
    {
        total = p.checked_add(c);
    }
    input = input.or(prompt);
    output = output.or(completion);

    let cached = usage
        .get("input_tokens_details")
        .or_else(|| usage.get("prompt_tokens_details"))
        .and_then(|d| int_field(d, "cached_tokens"));
    let reasoning = usage
        .get("output_tokens_details")
        .or_else(|| usage.get("completion_tokens_details"))
        .and_then(|d| int_field(d, "reasoning_tokens"));

    UsageReport {
        input_tokens: input,
        output_tokens: output,
        total_tokens: total,
        cached_input_tokens: cached,
        reasoning_output_tokens: reasoning,
    }
}

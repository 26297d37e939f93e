//! Deterministic response-shape repair.
//!
//! Upstreams in the wild return bodies missing ids, timestamps, choice
//! indices, usage components, or string-typed tool arguments. Repair fills
//! every hole with a deterministic default and logs each fill, then parses
//! the result into the canonical chat-completion shape. Repairing an
//! already-canonical response is a no-op.

use chrono::Utc;
use log::debug;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use straylight_common::chat::ChatCompletionResponse;
use straylight_common::context::PipelineContext;
use straylight_common::error::{ProtocolViolation, ProxyError};

const STAGE: &str = "response-repair";

/// Nine base36 characters of request-unique randomness.
fn rand36() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple.chars().take(9).collect()
}

/// Repairs an upstream body into the canonical chat-completion shape.
///
/// # Errors
///
/// Returns a protocol error when the body is not a JSON object or still
/// fails to parse after repair.
pub fn repair(
    mut value: Value,
    provider: &str,
    ctx: &mut PipelineContext,
) -> Result<ChatCompletionResponse, ProxyError> {
    let timestamp = Utc::now().timestamp();

    {
        let obj = value.as_object_mut().ok_or_else(|| {
            ProxyError::protocol(
                ProtocolViolation::UnsupportedResponseFormat,
                "upstream response body is not a JSON object",
            )
        })?;

        repair_envelope(obj, provider, timestamp, ctx);
        repair_choices(obj, provider, timestamp, ctx);
        repair_usage(obj, ctx);
    }

    serde_json::from_value(value).map_err(|e| {
        ProxyError::protocol(
            ProtocolViolation::UnsupportedResponseFormat,
            format!("upstream response failed to parse after repair: {e}"),
        )
    })
}

fn repair_envelope(
    obj: &mut Map<String, Value>,
    provider: &str,
    timestamp: i64,
    ctx: &mut PipelineContext,
) {
    if !obj.get("id").is_some_and(Value::is_string) {
        let id = format!("chatcmpl-{provider}-{timestamp}-{}", rand36());
        debug!("synthesized response id {id}");
        ctx.record_transformation(STAGE, "response_id_synthesized", Some(id.clone()));
        obj.insert("id".to_string(), Value::String(id));
    }

    if obj.get("object").and_then(Value::as_str) != Some("chat.completion") {
        if obj.contains_key("object") {
            ctx.record_transformation(STAGE, "response_object_forced", None);
        }
        obj.insert(
            "object".to_string(),
            Value::String("chat.completion".to_string()),
        );
    }

    if !obj.get("created").is_some_and(Value::is_u64) {
        obj.insert("created".to_string(), json!(timestamp.max(0)));
        ctx.record_transformation(STAGE, "response_created_defaulted", None);
    }

    if !obj.get("model").is_some_and(Value::is_string) {
        obj.insert("model".to_string(), Value::String(provider.to_string()));
        ctx.record_transformation(STAGE, "response_model_defaulted", None);
    }
}

fn repair_choices(
    obj: &mut Map<String, Value>,
    provider: &str,
    timestamp: i64,
    ctx: &mut PipelineContext,
) {
    let needs_default = obj
        .get("choices")
        .and_then(Value::as_array)
        .is_none_or(Vec::is_empty);
    if needs_default {
        obj.insert(
            "choices".to_string(),
            json!([{
                "index": 0,
                "message": {"role": "assistant", "content": ""},
                "finish_reason": "stop"
            }]),
        );
        ctx.record_transformation(STAGE, "response_choices_defaulted", None);
        return;
    }

    let Some(choices) = obj.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };

    for (position, choice) in choices.iter_mut().enumerate() {
        let Some(choice_obj) = choice.as_object_mut() else {
            continue;
        };

        if !choice_obj.get("index").is_some_and(Value::is_u64) {
            choice_obj.insert("index".to_string(), json!(position));
            ctx.record_transformation(STAGE, "choice_index_defaulted", None);
        }

        let has_tool_calls = choice_obj
            .get("message")
            .and_then(|m| m.get("tool_calls"))
            .and_then(Value::as_array)
            .is_some_and(|t| !t.is_empty());

        if !choice_obj.get("finish_reason").is_some_and(Value::is_string) {
            let reason = if has_tool_calls { "tool_calls" } else { "stop" };
            choice_obj.insert("finish_reason".to_string(), json!(reason));
            ctx.record_transformation(STAGE, "finish_reason_defaulted", Some(reason.to_string()));
        }

        if let Some(calls) = choice_obj
            .get_mut("message")
            .and_then(|m| m.get_mut("tool_calls"))
            .and_then(Value::as_array_mut)
        {
            for call in calls {
                repair_tool_call(call, provider, timestamp, ctx);
            }
        }
    }
}

fn repair_tool_call(call: &mut Value, provider: &str, timestamp: i64, ctx: &mut PipelineContext) {
    let Some(call_obj) = call.as_object_mut() else {
        return;
    };

    if !call_obj.get("id").is_some_and(Value::is_string) {
        let id = format!("call_{provider}_{timestamp}_{}", rand36());
        call_obj.insert("id".to_string(), Value::String(id.clone()));
        ctx.record_transformation(STAGE, "tool_call_id_synthesized", Some(id));
    }

    if !call_obj.get("type").is_some_and(Value::is_string) {
        call_obj.insert("type".to_string(), json!("function"));
        ctx.record_transformation(STAGE, "tool_call_type_defaulted", None);
    }

    if let Some(function) = call_obj.get_mut("function").and_then(Value::as_object_mut) {
        let coerced = match function.get("arguments") {
            Some(Value::String(_)) => None,
            Some(other) => Some(
                serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
            ),
            None => Some("{}".to_string()),
        };
        if let Some(arguments) = coerced {
            function.insert("arguments".to_string(), Value::String(arguments));
            ctx.record_transformation(STAGE, "tool_arguments_coerced", None);
        }
    }
}

fn repair_usage(obj: &mut Map<String, Value>, ctx: &mut PipelineContext) {
    if !obj.contains_key("usage") {
        obj.insert(
            "usage".to_string(),
            json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}),
        );
        ctx.record_transformation(STAGE, "usage_defaulted", None);
        return;
    }

    let Some(usage) = obj.get_mut("usage").and_then(Value::as_object_mut) else {
        return;
    };

    // Alias alternate field names onto the canonical ones.
    for (alias, canonical) in [
        ("input_tokens", "prompt_tokens"),
        ("output_tokens", "completion_tokens"),
    ] {
        if !usage.contains_key(canonical)
            && let Some(aliased) = usage.remove(alias)
        {
            usage.insert(canonical.to_string(), aliased);
            ctx.record_transformation(STAGE, "usage_fields_aliased", Some(alias.to_string()));
        }
    }

    for field in ["prompt_tokens", "completion_tokens", "total_tokens"] {
        if !usage.get(field).is_some_and(Value::is_u64) {
            usage.insert(field.to_string(), json!(0));
        }
    }

    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = usage.get("total_tokens").and_then(Value::as_u64).unwrap_or(0);
    if total == 0 && prompt + completion > 0 {
        usage.insert("total_tokens".to_string(), json!(prompt + completion));
        ctx.record_transformation(STAGE, "usage_total_filled", None);
    }
}

/// Strips a DeepSeek-style `thinking` field, recording its length.
pub fn strip_thinking(value: &mut Value, ctx: &mut PipelineContext) {
    let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };
    for choice in choices {
        if let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut)
            && let Some(thinking) = message.remove("thinking")
        {
            let length = thinking.as_str().map_or(0, str::len);
            ctx.record_transformation(
                STAGE,
                "deepseek_thinking_stripped",
                Some(length.to_string()),
            );
        }
    }
}

/// Rewrites an Ollama generate body into the chat-completion shape.
///
/// `{response, done, prompt_eval_count, eval_count}` becomes a single
/// assistant choice with the counters mapped onto usage.
#[must_use]
pub fn rewrite_ollama(value: &Value, ctx: &mut PipelineContext) -> Option<Value> {
    let obj = value.as_object()?;
    let response = obj.get("response")?.as_str()?;
    obj.get("done")?;

    let prompt = obj.get("prompt_eval_count").and_then(Value::as_u64).unwrap_or(0);
    let completion = obj.get("eval_count").and_then(Value::as_u64).unwrap_or(0);

    ctx.record_transformation(STAGE, "ollama_response_rewritten", None);
    Some(json!({
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": response},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    }))
}

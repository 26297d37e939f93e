//! Drive a tool-call round trip: offer a tool, answer the model's call,
//! and send the result back on the same conversation.
//!
//! Expects an LM Studio server on localhost:1234 with any model loaded.

use std::time::Duration;

use straylight::{CancelSignal, ProxyCore};
use straylight_common::CoreConfig;
use straylight_common::messages::{
    ClientMessage, ClientRole, ContentBlock, MessagesRequest, ToolDefinition, ToolResultContent,
};

const CONFIG: &str = r#"
[[providers]]
name = "lmstudio"
family = "lmstudio"
base_url = "http://localhost:1234/v1"
supported_models = ["llama-3.1-8b-instruct"]
context_length = 16384
skip_authentication = true

[[router.routes]]
label = "claude-3-5-sonnet"
pipelines = ["lmstudio-llama-3.1-8b-instruct-key0"]
"#;

fn weather_tool() -> ToolDefinition {
    ToolDefinition {
        name: "get_weather".to_string(),
        description: "Get the current weather for a city.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config: CoreConfig = toml::from_str(CONFIG)?;
    let core = ProxyCore::assemble(config)?;
    core.start().await?;

    let mut history = vec![ClientMessage::text(
        ClientRole::User,
        "What's the weather in Paris right now?",
    )];

    let first = MessagesRequest::builder()
        .model("claude-3-5-sonnet".to_string())
        .max_tokens(Some(256))
        .messages(history.clone())
        .tools(Some(vec![weather_tool()]))
        .build();

    let reply = core
        .handle(
            first,
            "demo-session",
            "demo-conversation",
            CancelSignal::never(),
            Some(Duration::from_secs(60)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{} ({})", e.error.message, e.error.error_type))?;

    // Echo every tool call back with a canned result.
    let mut results = Vec::new();
    for block in &reply.content {
        match block {
            ContentBlock::Text { text } => println!("assistant: {text}"),
            ContentBlock::ToolUse { id, name, input } => {
                println!("tool call: {name}({input}) [{id}]");
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: Some(ToolResultContent::Text("18°C, overcast".to_string())),
                    is_error: None,
                });
            }
            _ => {}
        }
    }

    if !results.is_empty() {
        history.push(ClientMessage::blocks(ClientRole::Assistant, reply.content.clone()));
        history.push(ClientMessage::blocks(ClientRole::User, results));

        let second = MessagesRequest::builder()
            .model("claude-3-5-sonnet".to_string())
            .max_tokens(Some(256))
            .messages(history)
            .tools(Some(vec![weather_tool()]))
            .build();

        let reply = core
            .handle(
                second,
                "demo-session",
                "demo-conversation",
                CancelSignal::never(),
                Some(Duration::from_secs(60)),
            )
            .await
            .map_err(|e| anyhow::anyhow!("{} ({})", e.error.message, e.error.error_type))?;

        for block in &reply.content {
            if let ContentBlock::Text { text } = block {
                println!("assistant: {text}");
            }
        }
    }

    core.shutdown().await;
    Ok(())
}

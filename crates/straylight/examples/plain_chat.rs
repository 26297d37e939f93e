//! Send one chat request through a locally assembled core.
//!
//! Expects an LM Studio server on localhost:1234 with any model loaded.
//!
//! ```bash
//! cargo run --example plain_chat
//! ```

use std::time::Duration;

use straylight::{CancelSignal, ProxyCore};
use straylight_common::CoreConfig;
use straylight_common::messages::{ClientMessage, ClientRole, ContentBlock, MessagesRequest};

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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config: CoreConfig = toml::from_str(CONFIG)?;
    let core = ProxyCore::assemble(config)?;
    core.start().await?;

    let request = MessagesRequest::builder()
        .model("claude-3-5-sonnet".to_string())
        .max_tokens(Some(256))
        .system(Some("You are terse.".to_string()))
        .messages(vec![ClientMessage::text(
            ClientRole::User,
            "Name three uses for a reverse proxy.",
        )])
        .build();

    match core
        .handle(
            request,
            "demo-session",
            "demo-conversation",
            CancelSignal::never(),
            Some(Duration::from_secs(60)),
        )
        .await
    {
        Ok(reply) => {
            for block in &reply.content {
                if let ContentBlock::Text { text } = block {
                    println!("{text}");
                }
            }
            println!(
                "\n[{} in, {} out, stop: {:?}]",
                reply.usage.input_tokens, reply.usage.output_tokens, reply.stop_reason
            );
        }
        Err(envelope) => {
            eprintln!(
                "request failed: {} ({})",
                envelope.error.message, envelope.error.error_type
            );
        }
    }

    core.shutdown().await;
    Ok(())
}

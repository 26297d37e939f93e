//! # straylight-pipeline
//!
//! Pipeline assembly, execution, and the uniform module lifecycle.
//!
//! [`Pipeline::assemble`] builds the sealed five-stage chain
//! (validator -> dialect codec -> protocol controller -> compat adapter ->
//! upstream client) for one {provider, model, key-index} tuple and
//! registers every stage with the [`ModuleRegistry`], which owns the
//! connection graph and the observability event bus.
//!
//! Execution threads a [`straylight_common::Payload`] forward through the
//! chain and the upstream's output backward through the same chain,
//! collecting per-stage timings on the pipeline context and failing fast
//! on the first stage error.

pub mod events;
pub mod module;
pub mod registry;
pub mod runner;
pub mod stages;

pub use events::PipelineEvent;
pub use module::{
    MetricsSnapshot, ModuleCore, ModuleHealth, ModuleIdentity, ModuleKind, ModuleMessage,
    ModuleMetrics, ModuleStatus, PipelineModule,
};
pub use registry::{ModuleRegistry, PipelineStatsSnapshot};
pub use runner::{ExecutionResult, Pipeline};

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::sync::Arc;
    use std::time::Duration;

    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use straylight_common::config::{ProtocolSettings, ProviderRecord};
    use straylight_common::context::{PipelineContext, RoutingCategory, RoutingDecision};
    use straylight_common::error::ErrorKind;
    use straylight_common::messages::{
        ClientMessage, ClientRole, ClientStopReason, ContentBlock, MessagesRequest,
    };
    use straylight_common::payload::Payload;
    use straylight_upstream::UpstreamClient;

    use super::*;

    fn lmstudio_record(base_url: &str) -> ProviderRecord {
        toml::from_str(&format!(
            r#"
name = "lmstudio"
family = "lmstudio"
base_url = "{base_url}"
supported_models = ["llama-3.1-8b-instruct"]
context_length = 16384
skip_authentication = true
timeout_seconds = 5
max_retries = 0
"#
        ))
        .unwrap()
    }

    fn decision(pipeline_id: &str, model: &str) -> RoutingDecision {
        RoutingDecision {
            original_model: "claude-3-5-sonnet".to_string(),
            mapped_model: model.to_string(),
            provider_type: "lmstudio".to_string(),
            provider_name: "lmstudio".to_string(),
            pipeline_id: pipeline_id.to_string(),
            key_index: 0,
            server_compatibility: Some("lmstudio".to_string()),
            endpoint: "unused".to_string(),
            api_key: None,
            timeout: Duration::from_secs(5),
            max_retries: 0,
            reasoning: "test".to_string(),
            category: RoutingCategory::Default,
        }
    }

    async fn started_pipeline(server: &MockServer) -> (Pipeline, Arc<ModuleRegistry>) {
        let record = lmstudio_record(&server.uri());
        let registry = Arc::new(ModuleRegistry::new());
        let upstream = Arc::new(UpstreamClient::from_record(&record).unwrap());
        let pipeline = Pipeline::assemble(
            "lmstudio-llama-3.1-8b-instruct-key0",
            &record,
            &ProtocolSettings::default(),
            upstream,
            Arc::clone(&registry),
        );
        pipeline.start().await.unwrap();
        (pipeline, registry)
    }

    fn client_request(max_tokens: u32) -> MessagesRequest {
        MessagesRequest::builder()
            .model("claude-3-5-sonnet".to_string())
            .max_tokens(Some(max_tokens))
            .messages(vec![ClientMessage::text(ClientRole::User, "Hello")])
            .build()
    }

    fn ctx_with_routing(pipeline_id: &str) -> PipelineContext {
        let mut ctx = PipelineContext::new("session-1", "conversation-1");
        ctx.set_routing(decision(pipeline_id, "llama-3.1-8b-instruct"))
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_plain_chat_end_to_end() {
        // Scenario: claude label routed to an LM Studio pipeline. The
        // upstream must see the mapped model, stream=false, and a capped
        // budget; the reply comes back in the client dialect.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "llama-3.1-8b-instruct",
                "stream": false,
                "messages": [{"role": "user", "content": "Hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "x",
                "object": "chat.completion",
                "created": 1700,
                "model": "llama-3.1-8b-instruct",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hi"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (pipeline, _registry) = started_pipeline(&server).await;
        let mut ctx = ctx_with_routing(pipeline.id());

        let result = pipeline
            .execute(Payload::ClientRequest(client_request(100)), &mut ctx)
            .await
            .unwrap();

        let Payload::ClientResponse(reply) = result.payload else {
            panic!("expected a client response");
        };
        assert!(matches!(&reply.content[0], ContentBlock::Text { text } if text == "Hi"));
        assert_eq!(reply.stop_reason, Some(ClientStopReason::EndTurn));
        assert_eq!(reply.usage.input_tokens, 1);
        assert_eq!(reply.usage.output_tokens, 1);
        assert!(result.success);
        // 5 modules, both directions.
        assert_eq!(result.module_results.len(), 10);
        assert_eq!(ctx.timings.len(), 10);
    }

    #[tokio::test]
    async fn test_oversized_budget_capped_before_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"max_tokens": 4096})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "x",
                "object": "chat.completion",
                "created": 1700,
                "model": "llama-3.1-8b-instruct",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "ok"},
                    "finish_reason": "stop"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (pipeline, _registry) = started_pipeline(&server).await;
        let mut ctx = ctx_with_routing(pipeline.id());

        pipeline
            .execute(Payload::ClientRequest(client_request(1_000_000)), &mut ctx)
            .await
            .unwrap();
        assert!(ctx.has_transformation("lmstudio_max_tokens_adjusted"));
    }

    #[tokio::test]
    async fn test_tool_call_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "x",
                "object": "chat.completion",
                "created": 1700,
                "model": "llama-3.1-8b-instruct",
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {
                                "name": "get_weather",
                                "arguments": "{\"city\":\"Paris\"}"
                            }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}
            })))
            .mount(&server)
            .await;

        let (pipeline, _registry) = started_pipeline(&server).await;
        let mut ctx = ctx_with_routing(pipeline.id());

        let mut request = client_request(100);
        request.tools = Some(vec![straylight_common::messages::ToolDefinition {
            name: "get_weather".to_string(),
            description: "look up weather".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        }]);

        let result = pipeline
            .execute(Payload::ClientRequest(request), &mut ctx)
            .await
            .unwrap();

        let Payload::ClientResponse(reply) = result.payload else {
            panic!("expected a client response");
        };
        assert_eq!(reply.stop_reason, Some(ClientStopReason::ToolUse));
        match &reply.content[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Paris");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mutation_fails_sealed() {
        let server = MockServer::start().await;
        let (pipeline, _registry) = started_pipeline(&server).await;

        assert_eq!(
            pipeline.remove_module("x").unwrap_err().kind,
            ErrorKind::PipelineSealed
        );
        assert_eq!(
            pipeline.set_module_order(&[]).unwrap_err().kind,
            ErrorKind::PipelineSealed
        );
    }

    #[tokio::test]
    async fn test_execute_before_start_rejected() {
        let server = MockServer::start().await;
        let record = lmstudio_record(&server.uri());
        let registry = Arc::new(ModuleRegistry::new());
        let upstream = Arc::new(UpstreamClient::from_record(&record).unwrap());
        let pipeline = Pipeline::assemble(
            "lmstudio-llama-3.1-8b-instruct-key0",
            &record,
            &ProtocolSettings::default(),
            upstream,
            registry,
        );

        let mut ctx = ctx_with_routing(pipeline.id());
        let err = pipeline
            .execute(Payload::ClientRequest(client_request(10)), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModuleNotRunning);
    }

    #[tokio::test]
    async fn test_failure_is_fail_fast_and_attributed() {
        // Upstream 500s; the error carries the upstream module id and the
        // registry records a failed execution.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": {"message": "backend exploded"}
            })))
            .mount(&server)
            .await;

        let (pipeline, registry) = started_pipeline(&server).await;
        let mut ctx = ctx_with_routing(pipeline.id());

        let err = pipeline
            .execute(Payload::ClientRequest(client_request(10)), &mut ctx)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ApiError);
        assert!(err.module.as_deref().unwrap().ends_with(".upstream"));
        assert_eq!(ctx.errors.len(), 1);

        let stats = registry
            .pipeline_stats("lmstudio-llama-3.1-8b-instruct-key0")
            .unwrap();
        assert_eq!(stats.failure, 1);
        assert_eq!(stats.success, 0);
    }

    #[tokio::test]
    async fn test_upstream_timeout_normalized_by_compat_hook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({}))
                    .set_delay(Duration::from_secs(20)),
            )
            .mount(&server)
            .await;

        let mut record = lmstudio_record(&server.uri());
        record.timeout_seconds = 1;
        let registry = Arc::new(ModuleRegistry::new());
        let upstream = Arc::new(UpstreamClient::from_record(&record).unwrap());
        let pipeline = Pipeline::assemble(
            "lmstudio-llama-3.1-8b-instruct-key0",
            &record,
            &ProtocolSettings::default(),
            upstream,
            registry,
        );
        pipeline.start().await.unwrap();

        let mut ctx = ctx_with_routing(pipeline.id());
        let err = pipeline
            .execute(Payload::ClientRequest(client_request(10)), &mut ctx)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::TimeoutError);
        // The compat adapter's map_error hook rewrote the phrasing.
        assert!(err.message.starts_with("Request timed out"));
    }

    #[tokio::test]
    async fn test_events_emitted_on_lifecycle_and_execution() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "x",
                "object": "chat.completion",
                "created": 1700,
                "model": "llama-3.1-8b-instruct",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hi"},
                    "finish_reason": "stop"
                }]
            })))
            .mount(&server)
            .await;

        let record = lmstudio_record(&server.uri());
        let registry = Arc::new(ModuleRegistry::new());
        let mut rx = registry.subscribe();
        let upstream = Arc::new(UpstreamClient::from_record(&record).unwrap());
        let pipeline = Pipeline::assemble(
            "lmstudio-llama-3.1-8b-instruct-key0",
            &record,
            &ProtocolSettings::default(),
            upstream,
            Arc::clone(&registry),
        );
        pipeline.start().await.unwrap();

        let mut ctx = ctx_with_routing(pipeline.id());
        pipeline
            .execute(Payload::ClientRequest(client_request(10)), &mut ctx)
            .await
            .unwrap();

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                PipelineEvent::PipelineStarted { .. } => saw_started = true,
                PipelineEvent::PipelineExecutionCompleted { execution_id, .. } => {
                    assert_eq!(execution_id, ctx.request_id);
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
    }
}

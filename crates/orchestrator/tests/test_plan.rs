//! Integration tests for the provider clients and orchestrator.

use costguard_config::AppConfig;
use costguard_orchestrator::{
    ChatMessage, ChatRole, Orchestrator, OrchestratorError, Provider, ProviderError,
    SelectionPreferences, StreamEvent, TokenUsage,
};
use futures_util::StreamExt;
use httpmock::prelude::*;

fn orchestrator_for(server: &MockServer) -> Orchestrator {
    let mut config = AppConfig::default();
    let base = server.base_url();
    config.providers.openai.base_url = format!("{base}/v1");
    config.providers.anthropic.base_url = format!("{base}/anthropic");
    config.providers.google.base_url = format!("{base}/gemini");
    config.providers.xai.base_url = format!("{base}/xai");
    config.providers.perplexity.base_url = base;
    config.chat.max_tokens = 256;
    Orchestrator::new(&config).expect("orchestrator")
}

fn user_turn(text: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::new(ChatRole::User, text)]
}

async fn collect(
    stream: costguard_orchestrator::EventStream,
) -> (String, Option<TokenUsage>, bool) {
    let events: Vec<_> = stream.collect().await;
    let mut text = String::new();
    let mut usage = None;
    let mut done = false;
    for event in events {
        match event.expect("stream event") {
            StreamEvent::Delta(delta) => text.push_str(&delta),
            StreamEvent::Usage(reported) => usage = Some(reported),
            StreamEvent::Done => done = true,
        }
    }
    (text, usage, done)
}

#[tokio::test]
async fn openai_completion_parses_content_and_usage() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-test")
                .json_body_partial(r#"{"model":"gpt-4o-mini","max_tokens":256}"#);
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Hello!"}}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
            }));
        })
        .await;

    let orchestrator = orchestrator_for(&server);
    let (spec, request) = orchestrator
        .chat_request(Provider::OpenAi, "gpt-4o-mini", user_turn("Hi"))
        .expect("request");
    assert_eq!(spec.model, "gpt-4o-mini");

    let completion = orchestrator
        .complete(Provider::OpenAi, "sk-test", &request)
        .await
        .expect("completion");

    mock.assert_async().await;
    assert_eq!(completion.content, "Hello!");
    assert_eq!(completion.usage, Some(TokenUsage::new(9, 3)));
}

#[tokio::test]
async fn openai_stream_emits_deltas_usage_and_done() {
    let server = MockServer::start_async().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
        "data: [DONE]\n\n",
    );
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/xai/chat/completions")
                .json_body_partial(r#"{"stream":true,"model":"grok-2-1212"}"#);
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        })
        .await;

    let orchestrator = orchestrator_for(&server);
    let (_, request) = orchestrator
        .chat_request(Provider::XAi, "grok-2", user_turn("Hi"))
        .expect("request");
    let stream = orchestrator
        .stream(Provider::XAi, "xai-key", &request)
        .await
        .expect("stream");

    let (text, usage, done) = collect(stream).await;
    mock.assert_async().await;
    assert_eq!(text, "Hello");
    assert_eq!(usage.map(|u| u.total_tokens), Some(7));
    assert!(done);
}

#[tokio::test]
async fn anthropic_stream_uses_messages_api() {
    let server = MockServer::start_async().await;
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Bonjour\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/anthropic/messages")
                .header("x-api-key", "sk-ant")
                .header("anthropic-version", "2023-06-01")
                .json_body_partial(r#"{"model":"claude-3-5-haiku-20241022","system":"Be kind."}"#);
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        })
        .await;

    let orchestrator = orchestrator_for(&server);
    let messages = vec![
        ChatMessage::new(ChatRole::System, "Be kind."),
        ChatMessage::new(ChatRole::User, "Say hello in French"),
    ];
    let (_, request) = orchestrator
        .chat_request(Provider::Anthropic, "claude-3.5-haiku", messages)
        .expect("request");
    let stream = orchestrator
        .stream(Provider::Anthropic, "sk-ant", &request)
        .await
        .expect("stream");

    let (text, usage, done) = collect(stream).await;
    mock.assert_async().await;
    assert_eq!(text, "Bonjour");
    assert_eq!(usage, Some(TokenUsage::new(10, 4)));
    assert!(done);
}

#[tokio::test]
async fn gemini_completion_passes_key_as_query() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/gemini/models/gemini-1.5-flash:generateContent")
                .query_param("key", "g-key");
            then.status(200).json_body(serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "42"}]}}],
                "usageMetadata": {"promptTokenCount": 6, "candidatesTokenCount": 1, "totalTokenCount": 7}
            }));
        })
        .await;

    let orchestrator = orchestrator_for(&server);
    let (_, request) = orchestrator
        .chat_request(Provider::Google, "gemini-1.5-flash", user_turn("What is 6*7?"))
        .expect("request");
    let completion = orchestrator
        .complete(Provider::Google, "g-key", &request)
        .await
        .expect("completion");

    mock.assert_async().await;
    assert_eq!(completion.content, "42");
    assert_eq!(completion.usage.map(|u| u.total_tokens), Some(7));
}

#[tokio::test]
async fn upstream_errors_carry_status_and_body() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(429).body("slow down");
        })
        .await;

    let orchestrator = orchestrator_for(&server);
    let (_, request) = orchestrator
        .chat_request(Provider::Perplexity, "sonar", user_turn("news?"))
        .expect("request");
    let error = orchestrator
        .stream(Provider::Perplexity, "pplx", &request)
        .await
        .err()
        .expect("stream should fail");

    match error {
        OrchestratorError::Provider(ProviderError::Upstream(message)) => {
            assert!(message.starts_with("provider returned 429"));
            assert!(message.ends_with("slow down"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn key_validation_reports_success_and_failure() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/models")
                .header("authorization", "Bearer good");
            then.status(200).json_body(serde_json::json!({"data": []}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/models")
                .header("authorization", "Bearer bad");
            then.status(401).body("invalid api key");
        })
        .await;

    let orchestrator = orchestrator_for(&server);
    let ok = orchestrator.validate_key(Provider::OpenAi, "good").await;
    assert!(ok.valid);
    assert!(ok.error.is_none());

    let rejected = orchestrator.validate_key(Provider::OpenAi, "bad").await;
    assert!(!rejected.valid);
    assert!(rejected.error.unwrap().contains("401"));
}

#[test]
fn unknown_models_are_rejected() {
    let orchestrator = Orchestrator::new(&AppConfig::default()).expect("orchestrator");
    let error = orchestrator
        .chat_request(Provider::OpenAi, "claude-3-opus", user_turn("Hi"))
        .unwrap_err();
    assert!(matches!(error, OrchestratorError::UnknownModel(name) if name == "openai/claude-3-opus"));
}

#[test]
fn recommend_returns_selection_with_alternatives() {
    let orchestrator = Orchestrator::new(&AppConfig::default()).expect("orchestrator");
    let selection = orchestrator
        .recommend(
            "Research the latest studies on sleep and cite sources",
            &[],
            &SelectionPreferences::default(),
        )
        .expect("selection");

    assert!(!selection.reasoning.is_empty());
    assert!(selection.alternatives.len() <= 3);
    assert!(selection.estimated_cost >= 0.0);
}

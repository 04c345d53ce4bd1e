use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tagstream_gateway::types::RateLimitConfig;
use tagstream_gateway::{
    AdapterSet, AnthropicAdapter, CacheStore, Error, FileCache, Gateway, GatewayConfig,
    MemoryCache, OpenAIAdapter, ProviderKind, ProviderSettings, RequestSpec, RetryPolicy,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(retry: RetryPolicy) -> GatewayConfig {
    GatewayConfig {
        concurrency: 2,
        rate_limit: RateLimitConfig::per_minute(100),
        retry,
        ..GatewayConfig::default()
    }
}

fn adapters(server: &MockServer) -> AdapterSet {
    AdapterSet::new()
        .with_adapter(AnthropicAdapter::new(
            ProviderSettings::anthropic(Some("test-key".to_string())).with_base_url(server.uri()),
        ))
        .with_adapter(OpenAIAdapter::new(
            ProviderSettings::openai(Some("test-key".to_string())).with_base_url(server.uri()),
        ))
}

fn gateway_for(server: &MockServer, cache: Arc<MemoryCache>, retry: RetryPolicy) -> Gateway {
    Gateway::new(config(retry), adapters(server), cache).unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10))
}

fn anthropic_completion(text: &str) -> serde_json::Value {
    json!({
        "id": "msg_01",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn"
    })
}

fn anthropic_delta(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}})
    )
}

fn anthropic_sse(parts: &[&str]) -> String {
    let mut body = String::from("event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n");
    for part in parts {
        body.push_str(&anthropic_delta(part));
    }
    body.push_str("data: {\"type\":\"message_stop\"}\n\n");
    body
}

async fn collect(gateway: &Gateway, spec: &RequestSpec) -> Vec<String> {
    gateway
        .stream(spec)
        .await
        .unwrap()
        .map(|delta| delta.unwrap())
        .collect()
        .await
}

#[tokio::test]
async fn test_completion_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-3-5-sonnet-20240620",
            "max_tokens": 400,
            "system": "Be brief",
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_completion("  Hi there  ")))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::new());
    let gateway = gateway_for(&server, Arc::clone(&cache), fast_retry());
    let spec = RequestSpec::new("Be brief", "Hello");

    assert_eq!(gateway.complete(&spec).await.unwrap(), "Hi there");
    assert_eq!(gateway.complete(&spec).await.unwrap(), "Hi there");
    assert!(cache.contains(&spec.cache_key()).await);
}

#[tokio::test]
async fn test_overrides_reach_the_request_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"temperature": 0.9, "max_tokens": 50})))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_completion("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, Arc::new(MemoryCache::new()), fast_retry());
    let spec = RequestSpec::new("sys", "prompt")
        .with_override("temperature", 0.9)
        .with_override("max_tokens", 50);

    assert_eq!(gateway.complete(&spec).await.unwrap(), "ok");
}

#[tokio::test]
async fn test_rate_limited_call_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_completion("finally")))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, Arc::new(MemoryCache::new()), fast_retry());
    let spec = RequestSpec::new("sys", "retry me");

    assert_eq!(gateway.complete(&spec).await.unwrap(), "finally");
}

#[tokio::test]
async fn test_rate_limit_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::new());
    let gateway = gateway_for(&server, Arc::clone(&cache), RetryPolicy::new(2, Duration::from_millis(5)));
    let spec = RequestSpec::new("sys", "never works");

    let err = gateway.complete(&spec).await.unwrap_err();
    assert!(matches!(
        err,
        Error::RateLimitExhausted { attempts: 3, .. }
    ));
    assert_eq!(err.status_code(), 500);
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, Arc::new(MemoryCache::new()), fast_retry());
    let err = gateway
        .complete(&RequestSpec::new("sys", "boom"))
        .await
        .unwrap_err();

    match err {
        Error::Transport { status, message, .. } => {
            assert_eq!(status, 500);
            assert!(message.contains("upstream exploded"));
        }
        other => panic!("expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_api_key_is_a_config_error() {
    let server = MockServer::start().await;
    let adapters = AdapterSet::new().with_adapter(AnthropicAdapter::new(
        ProviderSettings::anthropic(None).with_base_url(server.uri()),
    ));
    let gateway = Gateway::new(config(fast_retry()), adapters, Arc::new(MemoryCache::new())).unwrap();

    let err = gateway
        .complete(&RequestSpec::new("sys", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_unregistered_provider_is_a_config_error() {
    let server = MockServer::start().await;
    let adapters = AdapterSet::new().with_adapter(AnthropicAdapter::new(
        ProviderSettings::anthropic(Some("k".to_string())).with_base_url(server.uri()),
    ));
    let gateway = Gateway::new(config(fast_retry()), adapters, Arc::new(MemoryCache::new())).unwrap();

    let spec = RequestSpec::new("sys", "hello").provider(ProviderKind::OpenAI);
    assert!(matches!(gateway.complete(&spec).await, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_empty_prompts_are_rejected() {
    let server = MockServer::start().await;
    let gateway = gateway_for(&server, Arc::new(MemoryCache::new()), fast_retry());

    let err = gateway.stream(&RequestSpec::new("", "")).await.err().unwrap();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_stream_yields_deltas_and_caches_full_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_string(anthropic_sse(&["Hel", "lo", " world"])))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::new());
    let gateway = gateway_for(&server, Arc::clone(&cache), fast_retry());
    let spec = RequestSpec::new("sys", "greet");

    assert_eq!(collect(&gateway, &spec).await, vec!["Hel", "lo", " world"]);
    assert_eq!(
        cache.get(&spec.cache_key()).await.unwrap().as_deref(),
        Some("Hello world")
    );

    // Served from cache as a single delta without a second call
    assert_eq!(collect(&gateway, &spec).await, vec!["Hello world"]);
    assert_eq!(gateway.complete(&spec).await.unwrap(), "Hello world");
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let server = MockServer::start().await;
    let body = format!(
        "{}data: {{not json\n\n{}",
        anthropic_delta("first"),
        anthropic_delta(" second")
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, Arc::new(MemoryCache::new()), fast_retry());
    let deltas = collect(&gateway, &RequestSpec::new("sys", "malformed")).await;
    assert_eq!(deltas, vec!["first", " second"]);
}

#[tokio::test]
async fn test_abandoned_stream_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string(anthropic_sse(&["one", "two", "three"])))
        .expect(2)
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::new());
    let gateway = gateway_for(&server, Arc::clone(&cache), fast_retry());
    let spec = RequestSpec::new("sys", "abandon");

    let mut stream = gateway.stream(&spec).await.unwrap();
    assert_eq!(gateway.available_slots(), 1);
    assert_eq!(stream.next().await.unwrap().unwrap(), "one");
    drop(stream);

    assert_eq!(gateway.available_slots(), 2);
    assert!(cache.is_empty().await);

    // A fresh request reaches the provider again
    assert_eq!(collect(&gateway, &spec).await, vec!["one", "two", "three"]);
    assert!(cache.contains(&spec.cache_key()).await);
}

#[tokio::test]
async fn test_empty_stream_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string(anthropic_sse(&[])))
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::new());
    let gateway = gateway_for(&server, Arc::clone(&cache), fast_retry());

    assert!(collect(&gateway, &RequestSpec::new("sys", "silence")).await.is_empty());
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_openai_stream() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Bon\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"jour\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "greet in French"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::new());
    let gateway = gateway_for(&server, Arc::clone(&cache), fast_retry());
    let spec = RequestSpec::new("sys", "greet in French").provider(ProviderKind::OpenAI);

    assert_eq!(collect(&gateway, &spec).await, vec!["Bon", "jour"]);
    assert_eq!(
        cache.get(&spec.cache_key()).await.unwrap().as_deref(),
        Some("Bonjour")
    );
}

#[tokio::test]
async fn test_openai_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Salut"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, Arc::new(MemoryCache::new()), fast_retry());
    let spec = RequestSpec::new("sys", "hi").provider(ProviderKind::OpenAI);
    assert_eq!(gateway.complete(&spec).await.unwrap(), "Salut");
}

#[tokio::test]
async fn test_providers_use_separate_cache_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_completion("from claude")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "from gpt"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, Arc::new(MemoryCache::new()), fast_retry());
    let spec = RequestSpec::new("sys", "same prompt");

    assert_eq!(gateway.complete(&spec).await.unwrap(), "from claude");
    assert_eq!(
        gateway
            .complete(&spec.clone().provider(ProviderKind::OpenAI))
            .await
            .unwrap(),
        "from gpt"
    );
}

#[tokio::test]
async fn test_provider_error_event_ends_stream_without_caching() {
    let server = MockServer::start().await;
    let body = format!(
        "{}event: error\ndata: {}\n\n",
        anthropic_delta("Œ<field name=\"Pros\">half"),
        json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(2)
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::new());
    let gateway = gateway_for(&server, Arc::clone(&cache), fast_retry());
    let spec = RequestSpec::new("sys", "overloaded");

    let items: Vec<Result<String, Error>> = gateway.stream(&spec).await.unwrap().collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "Œ<field name=\"Pros\">half");
    assert!(matches!(items[1], Err(Error::Transport { status: 200, .. })));
    assert!(cache.is_empty().await);
    assert_eq!(gateway.available_slots(), 2);

    // The broken generation is not replayed
    let retried: Vec<Result<String, Error>> = gateway.stream(&spec).await.unwrap().collect().await;
    assert!(retried.last().unwrap().is_err());
}

#[tokio::test]
async fn test_calls_beyond_pool_size_wait_for_a_slot() {
    let delay = Duration::from_millis(300);
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(anthropic_completion("slow"))
                .set_delay(delay),
        )
        .expect(2)
        .mount(&server)
        .await;

    let config = GatewayConfig {
        concurrency: 1,
        ..config(fast_retry())
    };
    let gateway = Gateway::new(config, adapters(&server), Arc::new(MemoryCache::new())).unwrap();
    let first = RequestSpec::new("sys", "first");
    let second = RequestSpec::new("sys", "second");

    let started = Instant::now();
    let (a, b) = tokio::join!(gateway.complete(&first), gateway.complete(&second));
    assert_eq!(a.unwrap(), "slow");
    assert_eq!(b.unwrap(), "slow");
    assert!(started.elapsed() >= delay * 2);
}

#[tokio::test]
async fn test_open_stream_holds_its_slot() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_string(anthropic_sse(&["a", "b"])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_completion("done")))
        .expect(1)
        .mount(&server)
        .await;

    let config = GatewayConfig {
        concurrency: 1,
        ..config(fast_retry())
    };
    let gateway = Gateway::new(config, adapters(&server), Arc::new(MemoryCache::new())).unwrap();

    let mut stream = gateway.stream(&RequestSpec::new("sys", "streamed")).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "a");
    assert_eq!(gateway.available_slots(), 0);

    let waiting = gateway.clone();
    let handle = tokio::spawn(async move {
        waiting.complete(&RequestSpec::new("sys", "queued")).await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished());

    drop(stream);
    assert_eq!(handle.await.unwrap().unwrap(), "done");
}

#[tokio::test]
async fn test_every_attempt_takes_a_rate_limit_token() {
    let interval = Duration::from_millis(400);
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_completion("ok")))
        .expect(2)
        .mount(&server)
        .await;

    let config = GatewayConfig {
        rate_limit: RateLimitConfig {
            max_requests: 1,
            interval,
        },
        ..config(RetryPolicy::new(3, Duration::from_millis(10)))
    };
    let gateway = Gateway::new(config, adapters(&server), Arc::new(MemoryCache::new())).unwrap();

    // The retry after a 10ms backoff still waits for the token of the first attempt
    let started = Instant::now();
    assert_eq!(gateway.complete(&RequestSpec::new("sys", "one")).await.unwrap(), "ok");
    assert!(started.elapsed() >= interval);
    assert_eq!(gateway.rate_limiter().available().await, 0);

    // A second cache miss waits for the retry's token
    let started = Instant::now();
    assert_eq!(gateway.complete(&RequestSpec::new("sys", "two")).await.unwrap(), "ok");
    assert!(started.elapsed() >= interval - Duration::from_millis(50));
}

#[tokio::test]
async fn test_corrupt_cache_entry_is_a_miss() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_completion("fresh")))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let spec = RequestSpec::new("sys", "corrupt");
    std::fs::write(dir.path().join(format!("{}.json", spec.cache_key())), "{not json").unwrap();

    let cache = Arc::new(FileCache::new(dir.path()));
    let gateway = Gateway::new(config(fast_retry()), adapters(&server), cache.clone()).unwrap();

    assert_eq!(gateway.complete(&spec).await.unwrap(), "fresh");
    assert_eq!(cache.get(&spec.cache_key()).await.unwrap().as_deref(), Some("fresh"));
    assert_eq!(gateway.complete(&spec).await.unwrap(), "fresh");
}

#[tokio::test]
async fn test_cache_write_failure_is_not_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_completion("uncached")))
        .expect(2)
        .mount(&server)
        .await;

    // A regular file where the cache directory's parent should be
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "").unwrap();
    let cache = Arc::new(FileCache::new(blocker.join("cache")));
    let gateway = Gateway::new(config(fast_retry()), adapters(&server), cache).unwrap();
    let spec = RequestSpec::new("sys", "unwritable");

    assert_eq!(gateway.complete(&spec).await.unwrap(), "uncached");
    assert_eq!(gateway.complete(&spec).await.unwrap(), "uncached");
}

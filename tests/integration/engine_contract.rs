//! HTTP engines against mocked OpenAI-compatible servers.

use crate::helpers::{WAIT, pcm_bytes, sse_body};
use cadence::config::{LlmConfig, SpeechConfig, SttConfig, TtsConfig};
use cadence::llm::{ApiCompletionEngine, ChatMessage, CompletionEngine, CompletionRequest};
use cadence::pipeline::generation::ReplyOutcome;
use cadence::stt::{HttpTranscriptionEngine, TranscriptEvent, TranscriptionEngine};
use cadence::tts::{HttpSynthesisEngine, SynthesisEngine};
use cadence::{PipelineCoordinator, SpeechError};
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_response(fragments: &[&str]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(sse_body(fragments))
}

fn llm_config(server: &MockServer) -> LlmConfig {
    LlmConfig {
        api_url: server.uri(),
        api_model: "test-model".to_owned(),
        ..LlmConfig::default()
    }
}

fn tts_config(server: &MockServer) -> TtsConfig {
    TtsConfig {
        api_url: server.uri(),
        chunk_samples: 2,
        ..TtsConfig::default()
    }
}

#[tokio::test]
async fn completion_streams_deltas_with_auth_and_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "test-model", "stream": true})))
        .respond_with(sse_response(&["Hello", ", ", "<think>hidden</think>world"]))
        .expect(1)
        .mount(&server)
        .await;

    let engine = ApiCompletionEngine::new(&LlmConfig {
        api_key: "sk-test".to_owned(),
        ..llm_config(&server)
    })
    .unwrap();
    let request = CompletionRequest {
        messages: vec![ChatMessage::system("Be brief."), ChatMessage::user("Hi")],
    };
    let Ok(stream) = engine.stream_completion(request).await else {
        panic!("completion should start");
    };
    let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
    assert_eq!(tokens.concat(), "Hello, world");

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["messages"][1]["role"], "user");
    assert_eq!(body["messages"][1]["content"], "Hi");
}

#[tokio::test]
async fn completion_error_status_surfaces_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"error": {"message": "model 'test-model' not found"}})),
        )
        .mount(&server)
        .await;

    let engine = ApiCompletionEngine::new(&llm_config(&server)).unwrap();
    match engine.stream_completion(CompletionRequest::default()).await {
        Err(SpeechError::Llm(message)) => {
            assert!(message.contains("404"), "{message}");
            assert!(message.contains("not found"), "{message}");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("404 must fail"),
    }
}

#[tokio::test]
async fn synthesis_requests_raw_pcm_and_rechunks_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .and(body_partial_json(json!({"input": "Hi there.", "response_format": "pcm"})))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(pcm_bytes(&[1, 2, 3, 4, 5])))
        .expect(1)
        .mount(&server)
        .await;

    let engine = HttpSynthesisEngine::new(&tts_config(&server)).unwrap();
    let Ok(stream) = engine.synthesize("Hi there.").await else {
        panic!("synthesis should start");
    };
    let chunks: Vec<Vec<i16>> = stream.map(|c| c.unwrap().samples).collect().await;
    assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    assert_eq!(engine.sample_rate(), 24_000);
}

#[tokio::test]
async fn transcription_uploads_each_utterance_as_wav() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": " turn on the lights "})))
        .expect(1)
        .mount(&server)
        .await;

    let config = SttConfig {
        api_url: server.uri(),
        language: "en".to_owned(),
        min_silence_ms: 40,
        min_speech_ms: 20,
        ..SttConfig::default()
    };
    let mut engine = HttpTranscriptionEngine::new(&config, 16_000).unwrap();

    // 20 ms blocks at 16 kHz.
    let speech = pcm_bytes(&[8_000i16, -8_000].repeat(160));
    let silence = pcm_bytes(&[0; 320]);
    let mut events = Vec::new();
    for block in [&speech, &speech, &speech, &silence, &silence] {
        events.extend(engine.feed_audio(block).await.unwrap());
    }
    assert_eq!(
        events,
        vec![
            TranscriptEvent::SpeechStart,
            TranscriptEvent::Final("turn on the lights".into()),
        ]
    );

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("name=\"model\""));
    assert!(body.contains("name=\"language\""));
    assert!(body.contains("filename=\"audio.wav\""));
    assert!(body.contains("RIFF"));
}

#[tokio::test]
async fn transcription_error_is_reported_and_engine_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let config = SttConfig {
        api_url: server.uri(),
        min_silence_ms: 20,
        min_speech_ms: 20,
        ..SttConfig::default()
    };
    let mut engine = HttpTranscriptionEngine::new(&config, 16_000).unwrap();
    let speech = pcm_bytes(&[8_000i16, -8_000].repeat(160));
    let silence = pcm_bytes(&[0; 320]);

    engine.feed_audio(&speech).await.unwrap();
    let result = engine.feed_audio(&silence).await;
    assert!(matches!(result, Err(SpeechError::Stt(ref m)) if m.contains("503")));
    engine.reset();
    assert_eq!(
        engine.feed_audio(&speech).await.unwrap(),
        vec![TranscriptEvent::SpeechStart]
    );
}

#[tokio::test]
async fn pipeline_runs_over_http_engines() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response(&["Hello, ", "how are you", "? I am fine."]))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(pcm_bytes(&[7; 4])))
        .mount(&server)
        .await;

    let config = SpeechConfig {
        llm: llm_config(&server),
        tts: tts_config(&server),
        ..SpeechConfig::default()
    };
    let llm = Arc::new(ApiCompletionEngine::new(&config.llm).unwrap());
    let tts = Arc::new(HttpSynthesisEngine::new(&config.tts).unwrap());
    let (pipeline, mut replies) = PipelineCoordinator::start(config, llm, tts);

    pipeline.prepare("Hi there");
    let mut reply = tokio::time::timeout(WAIT, replies.recv())
        .await
        .unwrap()
        .unwrap();
    let mut samples = 0;
    while let Some(chunk) = tokio::time::timeout(WAIT, reply.next_audio()).await.unwrap() {
        samples += chunk.samples.len();
    }
    // Two synthesis calls of four samples each.
    assert_eq!(samples, 8);
    assert_eq!(
        reply.outcome().await,
        ReplyOutcome::Completed {
            text: "Hello, how are you? I am fine.".into()
        }
    );

    let speech_requests = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/v1/audio/speech")
        .count();
    assert_eq!(speech_requests, 2);
    pipeline.shutdown().await;
}

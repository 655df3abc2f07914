//! HTTP adapters against a local stand-in provider.

use axum::body::Bytes;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use solace_types::{ContextTurn, Sender, VoiceProfile};
use solace_voice::{
    AdapterError, AudioStore, Endpoint, GenerationRequest, Generator, HttpGenerator,
    HttpSynthesizer, HttpTranscriber, Synthesizer, Transcriber,
};
use std::time::Duration;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn chat(Json(body): Json<Value>) -> Json<Value> {
    let messages = body["messages"].as_array().cloned().unwrap_or_default();
    let roles: Vec<String> = messages
        .iter()
        .map(|m| m["role"].as_str().unwrap_or_default().to_string())
        .collect();
    let last = messages
        .last()
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();
    Json(json!({
        "choices": [{"message": {"content": format!(" {} | {} ", roles.join(","), last)}}],
        "usage": {"prompt_tokens": 42, "completion_tokens": 7}
    }))
}

#[tokio::test]
async fn generator_sends_context_and_maps_usage() {
    let base = serve(Router::new().route("/v1/chat/completions", post(chat))).await;
    let generator = HttpGenerator::new(
        Endpoint::new(format!("{}/v1/", base)).with_api_key("sk-test"),
        "test-model",
    );

    let generation = generator
        .generate(&GenerationRequest {
            conversation_id: "c1".to_string(),
            user_text: "Estou ansiosa".to_string(),
            context: vec![
                ContextTurn {
                    sender: Sender::User,
                    text: "Oi".to_string(),
                },
                ContextTurn {
                    sender: Sender::System,
                    text: "Olá!".to_string(),
                },
            ],
        })
        .await
        .unwrap();

    assert_eq!(generation.text, "system,user,assistant,user | Estou ansiosa");
    assert_eq!(generation.tokens_in, Some(42));
    assert_eq!(generation.tokens_out, Some(7));
}

#[tokio::test]
async fn provider_status_codes_are_classified() {
    let app = Router::new()
        .route(
            "/down",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        )
        .route(
            "/bad",
            post(|| async { (StatusCode::BAD_REQUEST, "unsupported codec") }),
        );
    let base = serve(app).await;

    let down = HttpTranscriber::new(Endpoint::new(format!("{}/down", base)));
    let err = down.transcribe(b"RIFF....").await.unwrap_err();
    assert!(matches!(err, AdapterError::Unavailable { .. }), "{err}");
    assert!(err.is_transient());

    let bad = HttpTranscriber::new(Endpoint::new(format!("{}/bad", base)));
    let err = bad.transcribe(b"RIFF....").await.unwrap_err();
    assert!(matches!(err, AdapterError::Rejected { .. }), "{err}");
    assert!(err.to_string().contains("unsupported codec"));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn slow_provider_times_out() {
    let app = Router::new().route(
        "/slow",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({"text": "late"}))
        }),
    );
    let base = serve(app).await;
    let transcriber = HttpTranscriber::new(
        Endpoint::new(format!("{}/slow", base)).with_timeout(Duration::from_millis(100)),
    );

    let err = transcriber.transcribe(b"audio").await.unwrap_err();
    assert!(matches!(err, AdapterError::Timeout { .. }), "{err}");
}

#[tokio::test]
async fn transcriber_defaults_missing_confidence() {
    let app = Router::new().route(
        "/stt",
        post(|body: Bytes| async move {
            assert_eq!(&body[..], b"audio");
            Json(json!({"text": "  Estou ansiosa  "}))
        }),
    );
    let base = serve(app).await;
    let transcriber = HttpTranscriber::new(Endpoint::new(format!("{}/stt", base)));

    let transcription = transcriber.transcribe(b"audio").await.unwrap();
    assert_eq!(transcription.text, "Estou ansiosa");
    assert_eq!(transcription.confidence, 1.0);
}

#[tokio::test]
async fn synthesizer_stores_audio_and_passes_the_profile() {
    let app = Router::new().route(
        "/tts",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["voiceId"], "ana");
            assert_eq!(body["sentencePauseMs"], 400);
            (
                [
                    (header::CONTENT_TYPE, "audio/mpeg"),
                    (header::HeaderName::from_static("x-audio-duration-ms"), "1234"),
                ],
                vec![0u8; 32],
            )
                .into_response()
        }),
    );
    let base = serve(app).await;
    let dir = tempfile::tempdir().unwrap();
    let store = AudioStore::new(dir.path());
    let synthesizer = HttpSynthesizer::new(Endpoint::new(format!("{}/tts", base)), store.clone());

    let profile = VoiceProfile::Therapeutic {
        voice_id: "ana".to_string(),
        speed: 0.9,
        sentence_pause_ms: 400,
    };
    let audio = synthesizer.synthesize("Respire fundo.", &profile).await.unwrap();

    assert!(audio.audio_ref.ends_with(".mp3"));
    assert_eq!(audio.duration_estimate_ms, 1234);
    assert_eq!(store.get(&audio.audio_ref).await.unwrap().len(), 32);
}

//! # Debug Endpoints
//!
//! Development probes for the pipeline stages without a WebSocket client:
//! run the reply chain on arbitrary text, exercise the synthesis chain, and
//! inspect which provider environment variables are set.
//!
//! Values are never echoed back — only whether each variable is set.

use crate::error::AppError;
use crate::pipeline::StageTimer;
use crate::providers::reply::build_reply_chain;
use crate::providers::tts::build_tts_chain;
use crate::state::AppState;
use actix_web::{web, HttpResponse, Result as ActixResult};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct TestTextRequest {
    pub text: String,
}

/// POST /debug/test-reply
///
/// Runs the configured reply chain and returns the reply together with the
/// per-variant stage records, so a failing variant is visible immediately.
pub async fn test_reply(
    state: web::Data<AppState>,
    req: web::Json<TestTextRequest>,
) -> ActixResult<HttpResponse, AppError> {
    if req.text.trim().is_empty() {
        return Err(AppError::ValidationError("text is required".to_string()));
    }

    let config = state.get_config();
    let chain = build_reply_chain(&config.reply);
    let mut stages = StageTimer::new();

    let reply = chain.generate(&req.text, &mut stages).await;

    Ok(HttpResponse::Ok().json(json!({
        "success": !reply.is_empty(),
        "reply": reply,
        "variants": chain.variant_names(),
        "stages": stages.report()
    })))
}

/// POST /debug/test-synthesis
///
/// Runs the configured synthesis chain and reports which variant produced
/// audio and how many bytes, without returning the audio itself.
pub async fn test_synthesis(
    state: web::Data<AppState>,
    req: web::Json<TestTextRequest>,
) -> ActixResult<HttpResponse, AppError> {
    if req.text.trim().is_empty() {
        return Err(AppError::ValidationError("text is required".to_string()));
    }

    let config = state.get_config();
    let chain = build_tts_chain(&config.tts);
    let mut stages = StageTimer::new();

    let audio = chain.synthesize(&req.text, &mut stages).await;

    Ok(HttpResponse::Ok().json(json!({
        "success": audio.is_some(),
        "audio_bytes": audio.map(|a| a.len()).unwrap_or(0),
        "variants": chain.variant_names(),
        "stages": stages.report()
    })))
}

/// GET /debug/environment
pub async fn debug_environment() -> ActixResult<HttpResponse, AppError> {
    let is_set = |var: &str| {
        if std::env::var(var).is_ok() {
            "set"
        } else {
            "not set"
        }
    };

    Ok(HttpResponse::Ok().json(json!({
        "ASSEMBLYAI_API_KEY": is_set("ASSEMBLYAI_API_KEY"),
        "OPENAI_API_KEY": is_set("OPENAI_API_KEY"),
        "ELEVENLABS_API_KEY": is_set("ELEVENLABS_API_KEY"),
        "AI_CHAT_URL": is_set("AI_CHAT_URL"),
        "KLARVIA_MODEL_CMD": is_set("KLARVIA_MODEL_CMD"),
        "WS_AUTH_TOKEN": is_set("WS_AUTH_TOKEN"),
        "RUST_LOG": std::env::var("RUST_LOG").unwrap_or_else(|_| "not set".to_string()),
    })))
}

/// Route configuration for the debug scope.
pub fn configure_debug_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/debug")
            .route("/test-reply", web::post().to(test_reply))
            .route("/test-synthesis", web::post().to(test_synthesis))
            .route("/environment", web::get().to(debug_environment)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_synthesis_probe_uses_silent_fallback() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let response = test_synthesis(
            state,
            web::Json(TestTextRequest {
                text: "hello".to_string(),
            }),
        )
        .await
        .unwrap();

        let body = to_bytes(response.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], true);
        assert!(parsed["audio_bytes"].as_u64().unwrap() > 0);
    }

    #[actix_web::test]
    async fn test_reply_probe_rejects_empty_text() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let result = test_reply(
            state,
            web::Json(TestTextRequest {
                text: "  ".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
    }
}

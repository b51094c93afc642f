//! # Capability Advertisement
//!
//! `GET /api/v1/config` tells clients which backends are active without
//! leaking any credentials: the STT backend a new session would use, the
//! reply variants in their fallback order, the TTS backend, and the audio
//! format the streaming endpoint expects.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "stt_backend": config.active_stt_backend(),
        "tts_backend": config.active_tts_backend(),
        "reply_variants": config.reply_variants(),
        "auth_required": config.auth.ws_token.is_some(),
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "channels": config.audio.channels,
            "bit_depth": config.audio.bit_depth
        },
        "endpoints": {
            "batch": "/ws/audio",
            "streaming": "/ws/audio-stream",
            "chat": "/api/v1/chat"
        }
    })))
}

/// Fallback for requests to unknown endpoints.
pub async fn not_found() -> HttpResponse {
    use actix_web::ResponseError;
    AppError::NotFound("unknown endpoint".to_string()).error_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_advertises_backends_without_secrets() {
        let mut config = AppConfig::default();
        config.stt.api_key = Some("very-secret-key".to_string());
        let state = web::Data::new(AppState::new(config));

        let response = get_config(state).await.unwrap();
        let body = to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains(r#""stt_backend":"vendor"#));
        assert!(!text.contains("very-secret-key"));
    }
}

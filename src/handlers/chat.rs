//! # Chat and Token Endpoints
//!
//! `POST /api/v1/chat` runs one transcript through the same reply fallback
//! chain the voice pipeline uses, without audio on either side. Useful for
//! frontend development and for exercising the chain in isolation.
//!
//! `POST /api/v1/token` issues an ephemeral development token.

use crate::error::{AppError, AppResult};
use crate::pipeline::StageTimer;
use crate::providers::reply::build_reply_chain;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
}

/// Single-turn text-in/text-out through the reply fallback chain.
pub async fn chat(
    state: web::Data<AppState>,
    body: web::Json<ChatRequest>,
) -> AppResult<HttpResponse> {
    let text = body.text.as_deref().unwrap_or("").trim().to_string();
    if text.is_empty() {
        return Err(AppError::BadRequest("text is required".to_string()));
    }

    info!(len = text.len(), "chat request");

    let config = state.get_config();
    let chain = build_reply_chain(&config.reply);
    let mut stages = StageTimer::new();

    let generated = chain.generate(&text, &mut stages).await;
    let reply = if generated.is_empty() {
        // Same substitution the voice pipeline applies on total fallthrough
        format!("You said: '{text}'.")
    } else {
        generated
    };

    info!(len = reply.len(), "chat reply");
    Ok(HttpResponse::Ok().json(ChatResponse { reply }))
}

/// Ephemeral development token issuance.
///
/// Deployments with a fixed shared token distribute it out of band; this
/// endpoint exists so local frontends can exercise the token query
/// parameter without extra setup.
pub async fn issue_token(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let token = Uuid::new_v4().simple().to_string();
    let expires_at =
        chrono::Utc::now() + chrono::Duration::seconds(config.auth.token_ttl_seconds as i64);

    HttpResponse::Ok().json(json!({
        "token": token,
        "expires_at": expires_at.to_rfc3339(),
        "auth_required": config.auth.ws_token.is_some()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::body::to_bytes;

    fn test_state() -> web::Data<AppState> {
        web::Data::new(AppState::new(AppConfig::default()))
    }

    #[actix_web::test]
    async fn test_chat_requires_text() {
        let result = chat(
            test_state(),
            web::Json(ChatRequest { text: None }),
        )
        .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let result = chat(
            test_state(),
            web::Json(ChatRequest {
                text: Some("   ".to_string()),
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[actix_web::test]
    async fn test_chat_runs_the_fallback_chain() {
        // Default config has only the rule-based variant configured
        let response = chat(
            test_state(),
            web::Json(ChatRequest {
                text: Some("hello".to_string()),
            }),
        )
        .await
        .unwrap();

        let body = to_bytes(response.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed["reply"].as_str().unwrap().contains("Klarvia"));
    }

    #[actix_web::test]
    async fn test_token_issuance_shape() {
        let response = issue_token(test_state()).await;
        let body = to_bytes(response.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(parsed["token"].as_str().unwrap().len(), 32);
        assert_eq!(parsed["auth_required"], false);
        assert!(parsed["expires_at"].is_string());
    }
}

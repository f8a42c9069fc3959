use crate::dtos::ExtractRequestDto;
use crate::services::extractor::{ExtractError, ExtractRequest, ExtractResult, TierPreference};
use crate::startup::AppState;
use axum::{extract::State, Json};
use service_core::error::AppError;

#[tracing::instrument(skip(state, request))]
pub async fn extract(
    State(state): State<AppState>,
    Json(request): Json<ExtractRequestDto>,
) -> Result<Json<ExtractResult>, AppError> {
    if request.remittance_text.trim().is_empty() && request.document_uris.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "either remittance_text or document_uris is required"
        )));
    }

    let extract_request = ExtractRequest {
        document_uris: request.document_uris,
        remittance_text: request.remittance_text,
        client_id: request.client_id,
        tier_preference: request
            .tier_preference
            .as_deref()
            .map(TierPreference::from_str)
            .unwrap_or_default(),
        confidence_threshold: request.confidence_threshold,
    };

    match state.extractor.extract(&extract_request).await {
        Ok(result) => Ok(Json(result)),
        Err(ExtractError::TierNotConfigured(tier)) => Err(AppError::BadRequest(anyhow::anyhow!(
            "extraction tier not configured: {}",
            tier
        ))),
        Err(e @ ExtractError::Unavailable { .. }) => {
            Err(AppError::ServiceUnavailable(e.to_string()))
        }
    }
}

use crate::dtos::DispatchResponse;
use crate::services::communicator::DispatchRequest;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;

#[tracing::instrument(skip(state, request), fields(template = %request.template_name))]
pub async fn dispatch_notification(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<DispatchResponse>), AppError> {
    if request.recipient.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "recipient must not be empty"
        )));
    }

    let receipt = state.communicator.dispatch(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchResponse {
            delivery_id: receipt.delivery_id,
            status: receipt.status.as_str().to_string(),
        }),
    ))
}

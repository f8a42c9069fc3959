use crate::dtos::{
    parse_amount, MatchResultDto, StartWorkflowRequest, StartWorkflowResponse,
    WorkflowStatusResponse,
};
use crate::models::NewTransaction;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[tracing::instrument(skip(state, request), fields(transaction_id = %request.transaction_id))]
pub async fn start_workflow(
    State(state): State<AppState>,
    Json(request): Json<StartWorkflowRequest>,
) -> Result<Response, AppError> {
    request.validate()?;
    let amount = parse_amount(&request.amount)?;

    let erp_system = request
        .erp_system
        .unwrap_or_else(|| state.config.erp.default_system.clone());
    if !state.erp.systems().contains(&erp_system) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "unknown ERP system: {}",
            erp_system
        )));
    }

    let new = NewTransaction {
        transaction_id: request.transaction_id,
        source_account_ref: request.source_account_ref,
        amount,
        currency: request.currency,
        value_date: request.value_date,
        raw_remittance_data: request.raw_remittance_data,
        customer_identifier: request.customer_identifier,
        associated_document_uris: request.associated_document_uris,
        erp_system,
    };

    let outcome = state.engine.start_workflow(new).await?;

    let status = if outcome.created {
        StatusCode::ACCEPTED
    } else {
        // Duplicate submission: surface the original workflow id.
        StatusCode::CONFLICT
    };
    let body = StartWorkflowResponse {
        workflow_id: outcome.workflow_id,
        status: if outcome.created {
            "Accepted".to_string()
        } else {
            "Duplicate".to_string()
        },
    };

    Ok((status, Json(body)).into_response())
}

#[tracing::instrument(skip(state))]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<WorkflowStatusResponse>, AppError> {
    let status = state.engine.get_status(workflow_id).await?;

    Ok(Json(WorkflowStatusResponse {
        workflow_id: status.workflow_id,
        transaction_id: status.transaction_id,
        state: status.state.as_str().to_string(),
        result: status
            .result
            .map(|(result, matches)| MatchResultDto::from_model(result, matches)),
        error: status.error,
    }))
}

#[tracing::instrument(skip(state))]
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.engine.cancel(workflow_id).await?;
    Ok(StatusCode::ACCEPTED)
}

use crate::dtos::{
    FetchInvoicesRequest, FetchInvoicesResponse, InvoiceDto, PostApplicationRequest,
    PostApplicationResponse,
};
use crate::services::erp::ConnectionProbe;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;
use validator::Validate;

#[tracing::instrument(skip(state, request), fields(erp_system = %request.erp_system))]
pub async fn fetch_invoices(
    State(state): State<AppState>,
    Json(request): Json<FetchInvoicesRequest>,
) -> Result<Json<FetchInvoicesResponse>, AppError> {
    request.validate()?;

    let fetched = state
        .erp
        .fetch_invoices(
            &request.erp_system,
            &request.invoice_ids,
            request.customer_id.as_deref(),
        )
        .await?;

    Ok(Json(FetchInvoicesResponse {
        invoices: fetched.invoices.into_iter().map(InvoiceDto::from).collect(),
        not_found: fetched.not_found,
    }))
}

#[tracing::instrument(skip(state, request), fields(transaction_id = %request.transaction_id))]
pub async fn post_application(
    State(state): State<AppState>,
    Json(request): Json<PostApplicationRequest>,
) -> Result<Response, AppError> {
    request.validate()?;
    let application = request.into_application()?;

    let posted = state.erp.post_application(&application).await?;

    // A replayed posting is reported as a conflict carrying the original
    // ERP transaction id.
    let status = if posted.duplicate {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    let body = PostApplicationResponse {
        erp_transaction_id: posted.erp_transaction_id,
        posted_at: posted.posted_at,
        duplicate: posted.duplicate,
    };

    Ok((status, Json(body)).into_response())
}

#[tracing::instrument(skip(state))]
pub async fn test_erp_connection(
    State(state): State<AppState>,
    Path(erp_system): Path<String>,
) -> Result<Json<ConnectionProbe>, AppError> {
    let probe = state.erp.test_connection(&erp_system).await?;
    Ok(Json(probe))
}

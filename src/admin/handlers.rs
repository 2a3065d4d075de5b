//! Admin API HTTP handlers

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::middleware::AdminState;
use super::types::{
    AddCredentialRequest, LoadBalancingModeResponse, SetDisabledRequest, SetLoadBalancingModeRequest,
    SetPriorityRequest, SuccessResponse,
};

/// GET /credentials
pub async fn get_all_credentials(State(state): State<AdminState>) -> Response {
    Json(state.service.get_all_credentials()).into_response()
}

/// POST /credentials
pub async fn add_credential(
    State(state): State<AdminState>,
    Json(req): Json<AddCredentialRequest>,
) -> Response {
    match state.service.add_credential(req).await {
        Ok(resp) => (StatusCode::CREATED, Json(resp)).into_response(),
        Err(e) => (e.status_code(), Json(e.into_response())).into_response(),
    }
}

/// DELETE /credentials/{id}
pub async fn delete_credential(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    match state.service.delete_credential(id) {
        Ok(()) => Json(SuccessResponse::new("Credential deleted successfully")).into_response(),
        Err(e) => (e.status_code(), Json(e.into_response())).into_response(),
    }
}

/// POST /credentials/{id}/disabled
pub async fn set_credential_disabled(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    Json(req): Json<SetDisabledRequest>,
) -> Response {
    match state.service.set_disabled(id, req.disabled) {
        Ok(()) => {
            let message = if req.disabled {
                "Credential disabled"
            } else {
                "Credential enabled"
            };
            Json(SuccessResponse::new(message)).into_response()
        }
        Err(e) => (e.status_code(), Json(e.into_response())).into_response(),
    }
}

/// POST /credentials/{id}/priority
pub async fn set_credential_priority(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    Json(req): Json<SetPriorityRequest>,
) -> Response {
    match state.service.set_priority(id, req.priority) {
        Ok(()) => Json(SuccessResponse::new("Priority updated")).into_response(),
        Err(e) => (e.status_code(), Json(e.into_response())).into_response(),
    }
}

/// POST /credentials/{id}/reset
pub async fn reset_failure_count(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    match state.service.reset_and_enable(id) {
        Ok(()) => Json(SuccessResponse::new("Failure count reset")).into_response(),
        Err(e) => (e.status_code(), Json(e.into_response())).into_response(),
    }
}

/// GET /credentials/{id}/balance
pub async fn get_credential_balance(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
) -> Response {
    match state.service.get_balance(id).await {
        Ok(balance) => Json(balance).into_response(),
        Err(e) => (e.status_code(), Json(e.into_response())).into_response(),
    }
}

/// GET /config/load-balancing
pub async fn get_load_balancing_mode(State(state): State<AdminState>) -> Response {
    Json(state.service.get_load_balancing_mode()).into_response()
}

/// PUT /config/load-balancing
pub async fn set_load_balancing_mode(
    State(state): State<AdminState>,
    Json(req): Json<SetLoadBalancingModeRequest>,
) -> Response {
    match state.service.set_load_balancing_mode(req) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => (e.status_code(), Json(e.into_response())).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_balancing_response_shape() {
        let resp = LoadBalancingModeResponse {
            mode: "priority".to_string(),
        };
        assert_eq!(resp.mode, "priority");
    }
}

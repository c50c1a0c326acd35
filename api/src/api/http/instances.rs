use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
};
use ringkeeper_core::{CreateRequest, Instance, Token};
use serde::Deserialize;

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

#[derive(Debug, Deserialize)]
pub struct CreateParams {
    pub id: u32,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    pub hostname: String,
    pub ip: String,
    pub rack: String,
    /// Explicit token claim; empty or absent lets the registry choose.
    #[serde(default)]
    pub token: Option<String>,
}

impl CreateParams {
    fn into_request(self, state: &AppState) -> ApiResult<CreateRequest> {
        let token = match self.token.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<Token>()
                    .map_err(|e| ApiError::bad_request(e.to_string()))?,
            ),
        };
        Ok(CreateRequest {
            application: state.application.clone(),
            datacenter: state.datacenter.clone(),
            id: self.id,
            instance_identifier: self.instance_id,
            hostname: self.hostname,
            address: self.ip,
            rack: self.rack,
            token,
        })
    }
}

fn line(instance: &Instance) -> String {
    format!("{instance}\n")
}

/// GET /v1/instances - every node of the application, ordered by id
pub async fn list_instances(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let instances = state.registry.list_ordered(&state.application).await?;
    let body: String = instances.iter().map(line).collect();
    Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], body))
}

/// GET /v1/instances/:id
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> ApiResult<impl IntoResponse> {
    let instance = state
        .registry
        .lookup(&state.application, &state.datacenter, id)
        .await?;
    Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], line(&instance)))
}

/// POST /v1/instances?id=&instanceID=&hostname=&ip=&rack=&token=
pub async fn create_instance(
    State(state): State<AppState>,
    Query(params): Query<CreateParams>,
) -> ApiResult<impl IntoResponse> {
    tracing::info!(
        id = params.id,
        instance_id = %params.instance_id,
        hostname = %params.hostname,
        ip = %params.ip,
        rack = %params.rack,
        token = params.token.as_deref().unwrap_or(""),
        "Registering instance"
    );

    let request = params.into_request(&state)?;
    let instance = state.registry.create(request).await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/{}", instance.id)),
            (header::CONTENT_TYPE, TEXT_PLAIN.to_string()),
        ],
        line(&instance),
    ))
}

/// DELETE /v1/instances/:id
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> ApiResult<StatusCode> {
    let removed = state.registry.delete(&state.application, id).await?;
    tracing::info!(id, token = %removed.token, "Instance deleted");
    Ok(StatusCode::NO_CONTENT)
}

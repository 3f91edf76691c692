// src/handlers.rs
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::models::{
    NewPoll, Page, PollAnalytics, PollChanges, PollId, PollListQuery, PollResults, PollSnapshot,
    VoteId, VoteOutcome, VoteRequest,
};
use crate::rate_limit::Scope;
use crate::routes::AppState;

/// Active, unexpired polls, paginated.
pub async fn list_polls(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<PollListQuery>,
) -> Result<Json<Page<PollSnapshot>>, ApiError> {
    Ok(Json(state.service.list_polls(&query).await?))
}

/// Polls created by the caller, newest first.
pub async fn my_polls(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Vec<PollSnapshot>>, ApiError> {
    Ok(Json(state.service.polls_of(user.id()).await?))
}

pub async fn create_poll(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(input): Json<NewPoll>,
) -> Result<(StatusCode, Json<PollSnapshot>), ApiError> {
    state.rate_limiter.check(Scope::Polls, user.id())?;
    let poll = state.service.create_poll(user.id(), input).await?;
    Ok((StatusCode::CREATED, Json(poll)))
}

/// A single poll; counts as a view.
pub async fn get_poll(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(poll_id): Path<PollId>,
) -> Result<Json<PollSnapshot>, ApiError> {
    Ok(Json(state.service.view_poll(poll_id).await?))
}

pub async fn update_poll(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(poll_id): Path<PollId>,
    Json(changes): Json<PollChanges>,
) -> Result<Json<PollSnapshot>, ApiError> {
    state.rate_limiter.check(Scope::Polls, user.id())?;
    Ok(Json(
        state.service.update_poll(poll_id, user.id(), changes).await?,
    ))
}

pub async fn delete_poll(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(poll_id): Path<PollId>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_poll(poll_id, user.id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn poll_results(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(poll_id): Path<PollId>,
) -> Result<Json<PollResults>, ApiError> {
    Ok(Json(state.service.results(poll_id).await?))
}

pub async fn poll_analytics(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(poll_id): Path<PollId>,
) -> Result<Json<PollAnalytics>, ApiError> {
    Ok(Json(state.service.analytics(poll_id, user.id()).await?))
}

pub async fn cast_vote(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(poll_id): Path<PollId>,
    Json(request): Json<VoteRequest>,
) -> Result<(StatusCode, Json<VoteOutcome>), ApiError> {
    state.rate_limiter.check(Scope::Votes, user.id())?;
    let outcome = state
        .service
        .cast_vote(user.id(), poll_id, request.option_id)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Retracts the caller's vote and returns the poll as it stands afterwards.
pub async fn retract_vote(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(vote_id): Path<VoteId>,
) -> Result<Json<PollSnapshot>, ApiError> {
    Ok(Json(state.service.retract_vote(user.id(), vote_id).await?))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

//! HTTP API for the reality node.

use crate::error::Error;
use crate::models::{Player, Proposal, ProposalId, StateSnapshot};
use crate::orchestrator::{AdvanceOutcome, Orchestrator, ProposalSubmission, VoteReceipt};
use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection},
        FromRequest, FromRequestParts, Path, Request, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nomic_ledger::LedgerError;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the API router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // Game
        .route("/state", get(get_state))
        .route("/rules", get(get_rules))
        .route("/start", post(start_game))
        .route("/advance", post(advance))
        .route("/turn-failed", post(turn_failed))
        // Players
        .route("/players", get(list_players).post(register_player))
        // Proposals and votes
        .route("/proposals", post(submit_proposal))
        .route("/proposals/:id", get(get_proposal))
        .route("/proposals/:id/withdraw", post(withdraw_proposal))
        .route("/votes/:id", post(submit_vote))
        .route("/history", get(history))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(orchestrator)
}

/// Error body: `{error, code}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// Orchestrator error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::DuplicatePlayer(_)
            | Error::GameAlreadyStarted
            | Error::InsufficientPlayers { .. }
            | Error::InvalidPhase(_)
            | Error::GameHalted(_)
            | Error::NotYourTurn { .. }
            | Error::ProposalAlreadyOpen(_)
            | Error::ProposalNotOpen(_)
            | Error::Ledger(LedgerError::BranchExists(_)) => StatusCode::CONFLICT,
            Error::PatchApplyFailed(_)
            | Error::InvalidInput(_)
            | Error::Behavior(_)
            | Error::Ledger(LedgerError::InvalidRef(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::ProposalNotFound(_) | Error::UnknownPlayer(_) | Error::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), "Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::InvalidInput(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(Error::InvalidInput(rejection.body_text()))
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` whose rejections render as [`ErrorBody`].
struct ApiJson<T>(T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// `Path` whose rejections render as [`ErrorBody`].
struct ApiPath<T>(T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

// --- Health ---

async fn health() -> &'static str {
    "OK"
}

// --- Game ---

async fn get_state(State(orchestrator): State<Orchestrator>) -> Json<StateSnapshot> {
    Json(orchestrator.snapshot().await)
}

#[derive(Debug, Serialize, Deserialize)]
struct RulesResponse {
    rules: String,
}

async fn get_rules(State(orchestrator): State<Orchestrator>) -> ApiResult<Json<RulesResponse>> {
    let rules = orchestrator.rules().await?;
    Ok(Json(RulesResponse { rules }))
}

async fn start_game(State(orchestrator): State<Orchestrator>) -> ApiResult<Json<StateSnapshot>> {
    Ok(Json(orchestrator.start_game().await?))
}

async fn advance(State(orchestrator): State<Orchestrator>) -> ApiResult<Json<AdvanceOutcome>> {
    Ok(Json(orchestrator.advance().await?))
}

#[derive(Debug, Deserialize)]
struct TurnFailedRequest {
    player: String,
    #[serde(default)]
    reason: String,
}

async fn turn_failed(
    State(orchestrator): State<Orchestrator>,
    ApiJson(req): ApiJson<TurnFailedRequest>,
) -> ApiResult<Json<StateSnapshot>> {
    Ok(Json(
        orchestrator
            .report_turn_failed(&req.player, &req.reason)
            .await?,
    ))
}

// --- Players ---

async fn list_players(State(orchestrator): State<Orchestrator>) -> Json<Vec<Player>> {
    Json(orchestrator.players().await)
}

#[derive(Debug, Deserialize)]
struct RegisterPlayerRequest {
    name: String,
    endpoint_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisterPlayerResponse {
    id: u32,
    name: String,
}

async fn register_player(
    State(orchestrator): State<Orchestrator>,
    ApiJson(req): ApiJson<RegisterPlayerRequest>,
) -> ApiResult<Json<RegisterPlayerResponse>> {
    let player = orchestrator
        .register_player(&req.name, &req.endpoint_url)
        .await?;
    Ok(Json(RegisterPlayerResponse {
        id: player.join_order,
        name: player.name,
    }))
}

// --- Proposals ---

#[derive(Debug, Serialize, Deserialize)]
struct SubmitProposalResponse {
    proposal_id: ProposalId,
}

async fn submit_proposal(
    State(orchestrator): State<Orchestrator>,
    ApiJson(req): ApiJson<ProposalSubmission>,
) -> ApiResult<(StatusCode, Json<SubmitProposalResponse>)> {
    let proposal_id = orchestrator.submit_proposal(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitProposalResponse { proposal_id }),
    ))
}

async fn get_proposal(
    State(orchestrator): State<Orchestrator>,
    ApiPath(id): ApiPath<ProposalId>,
) -> ApiResult<Json<Proposal>> {
    Ok(Json(orchestrator.proposal(id).await?))
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    proposer: String,
}

async fn withdraw_proposal(
    State(orchestrator): State<Orchestrator>,
    ApiPath(id): ApiPath<ProposalId>,
    ApiJson(req): ApiJson<WithdrawRequest>,
) -> ApiResult<Json<Proposal>> {
    Ok(Json(orchestrator.withdraw(id, &req.proposer).await?))
}

#[derive(Debug, Deserialize)]
struct VoteBody {
    voter: String,
    vote: bool,
}

async fn submit_vote(
    State(orchestrator): State<Orchestrator>,
    ApiPath(id): ApiPath<ProposalId>,
    ApiJson(req): ApiJson<VoteBody>,
) -> ApiResult<Json<VoteReceipt>> {
    Ok(Json(orchestrator.submit_vote(id, &req.voter, req.vote).await?))
}

async fn history(State(orchestrator): State<Orchestrator>) -> ApiResult<Json<Vec<Proposal>>> {
    Ok(Json(orchestrator.history().await?))
}

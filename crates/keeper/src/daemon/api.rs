use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use keeper_core::{ControlPlane, ProcessSummary, Stream, SupervisorError, UsageSample};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub const TOKEN_HEADER: &str = "x-keeper-token";

#[derive(Clone)]
pub struct AppState {
	pub control: Arc<ControlPlane>,
	pub token: Option<Arc<str>>,
}

pub fn router(control: Arc<ControlPlane>, token: Option<String>) -> Router {
	let state = AppState {
		control,
		token: token.map(Arc::from),
	};

	Router::new()
		.route("/api/processes", get(list_processes))
		.route("/api/processes/{pid}/stats", get(process_stats))
		.route("/api/processes/{pid}/stdout", get(process_stdout))
		.route("/api/processes/{pid}/stderr", get(process_stderr))
		.route("/api/processes/{pid}/kill", post(kill_process))
		.route("/api/processes/{pid}/start", post(start_process))
		.route("/api/processes/{pid}/restart", post(restart_process))
		.route("/api/processes/{pid}/detach", post(detach_process))
		.route("/api/jobs/{name}", get(job_status))
		.layer(middleware::from_fn_with_state(state.clone(), require_token))
		.layer(CorsLayer::permissive())
		.with_state(state)
}

#[derive(Serialize)]
struct ActionResponse {
	message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
	error: String,
}

#[derive(Serialize)]
struct StatsResponse {
	pid: u32,
	#[serde(flatten)]
	usage: UsageSample,
}

#[derive(Serialize)]
struct OutputResponse {
	pid: u32,
	lines: Vec<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: SupervisorError) -> ApiError {
	let status = if e.is_not_found() {
		StatusCode::NOT_FOUND
	} else if e.is_forbidden() {
		StatusCode::FORBIDDEN
	} else {
		StatusCode::INTERNAL_SERVER_ERROR
	};
	(status, Json(ErrorResponse { error: e.to_string() }))
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
	if let Some(expected) = &state.token {
		let given = request
			.headers()
			.get(TOKEN_HEADER)
			.and_then(|v| v.to_str().ok());
		if given != Some(&**expected) {
			return (
				StatusCode::UNAUTHORIZED,
				Json(ErrorResponse {
					error: "unauthorized".to_string(),
				}),
			)
				.into_response();
		}
	}
	next.run(request).await
}

async fn list_processes(State(state): State<AppState>) -> Json<Vec<ProcessSummary>> {
	Json(state.control.list_all().await)
}

async fn job_status(
	State(state): State<AppState>,
	Path(name): Path<String>,
) -> Result<Json<ProcessSummary>, ApiError> {
	state.control.status_by_name(&name).await.map(Json).map_err(api_error)
}

async fn process_stats(
	State(state): State<AppState>,
	Path(pid): Path<u32>,
) -> Result<Json<StatsResponse>, ApiError> {
	state
		.control
		.stats(pid)
		.await
		.map(|usage| Json(StatsResponse { pid, usage }))
		.map_err(api_error)
}

async fn process_stdout(state: State<AppState>, pid: Path<u32>) -> Result<Json<OutputResponse>, ApiError> {
	read_stream(state, pid, Stream::Stdout).await
}

async fn process_stderr(state: State<AppState>, pid: Path<u32>) -> Result<Json<OutputResponse>, ApiError> {
	read_stream(state, pid, Stream::Stderr).await
}

async fn read_stream(
	State(state): State<AppState>,
	Path(pid): Path<u32>,
	stream: Stream,
) -> Result<Json<OutputResponse>, ApiError> {
	state
		.control
		.read_output(pid, stream)
		.await
		.map(|lines| Json(OutputResponse { pid, lines }))
		.map_err(api_error)
}

fn action(result: Result<String, SupervisorError>) -> Result<Json<ActionResponse>, ApiError> {
	result.map(|message| Json(ActionResponse { message })).map_err(api_error)
}

async fn kill_process(
	State(state): State<AppState>,
	Path(pid): Path<u32>,
) -> Result<Json<ActionResponse>, ApiError> {
	action(state.control.kill(pid).await)
}

async fn start_process(
	State(state): State<AppState>,
	Path(pid): Path<u32>,
) -> Result<Json<ActionResponse>, ApiError> {
	action(state.control.start_pid(pid).await)
}

async fn restart_process(
	State(state): State<AppState>,
	Path(pid): Path<u32>,
) -> Result<Json<ActionResponse>, ApiError> {
	action(state.control.restart_pid(pid).await)
}

async fn detach_process(
	State(state): State<AppState>,
	Path(pid): Path<u32>,
) -> Result<Json<ActionResponse>, ApiError> {
	action(state.control.detach_pid(pid).await)
}

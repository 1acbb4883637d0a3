use std::sync::Arc;

use actix_web::{middleware, web, App, HttpRequest, HttpResponse, HttpServer, Result};
use chrono::Utc;
use serde::Serialize;

use crate::display::write_rounds_csv;
use crate::error::{EngineError, SolverError};
use crate::event::{EventRegistry, EventState};
use crate::matching::{PairKey, ParticipantId, Source};
use crate::requests::{
    validate_registration, validate_scores, validate_settings, validate_swap, CheckInRequest, CheckOutRequest,
    CreateEventRequest, ScoresRequest, SettingsRequest, SignalRequest, SwapRequest,
};
use crate::roster::Roster;

pub struct AppState {
    pub registry: Arc<EventRegistry>,
    pub admin_password: String,
}

/// Snapshot plus the values clients would otherwise derive themselves.
#[derive(Serialize)]
struct StateView<'a> {
    #[serde(flatten)]
    state: &'a EventState,
    active_count: usize,
    remaining_secs: Option<u64>,
    average_score: f64,
}

fn error_response(err: &EngineError) -> HttpResponse {
    let body = serde_json::json!({
        "success": false,
        "error": err.to_string(),
        "retryable": err.is_retryable(),
    });
    match err {
        EngineError::UnknownEvent(_) | EngineError::UnknownParticipant(_) => HttpResponse::NotFound().json(body),
        EngineError::InvalidTransition { .. } | EngineError::RoundsExhausted { .. } => {
            HttpResponse::Conflict().json(body)
        }
        EngineError::Solver(SolverError::Infeasible { .. }) | EngineError::ConstraintViolation(_) => {
            HttpResponse::UnprocessableEntity().json(body)
        }
        EngineError::SignalRejected(_) | EngineError::InvalidRequest(_) => HttpResponse::BadRequest().json(body),
        EngineError::CommitFailure(_) => HttpResponse::ServiceUnavailable().json(body),
        EngineError::Internal(_) => HttpResponse::InternalServerError().json(body),
    }
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({"success": false, "error": message}))
}

fn is_admin(req: &HttpRequest, state: &AppState) -> bool {
    let password = req
        .headers()
        .get("X-Admin-Password")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    password == state.admin_password
}

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(serde_json::json!({"success": false, "error": "Unauthorized"}))
}

macro_rules! require_admin {
    ($req:expr, $state:expr) => {
        if !is_admin(&$req, &$state) {
            return Ok(unauthorized());
        }
    };
}

macro_rules! try_engine {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return Ok(error_response(&e)),
        }
    };
}

async fn health() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "ok"})))
}

async fn list_events(state: web::Data<AppState>) -> Result<HttpResponse> {
    let ids = try_engine!(state.registry.event_ids());
    Ok(HttpResponse::Ok().json(serde_json::json!({ "events": ids })))
}

async fn get_state(event_id: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    let event = try_engine!(state.registry.get(&event_id));
    let snapshot = try_engine!(event.snapshot());
    Ok(HttpResponse::Ok().json(StateView {
        state: &snapshot,
        active_count: snapshot.active_pool().len(),
        remaining_secs: snapshot.timer.remaining(Utc::now()),
        average_score: snapshot.average_score(),
    }))
}

async fn get_mutual_matches(event_id: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    let event = try_engine!(state.registry.get(&event_id));
    let snapshot = try_engine!(event.snapshot());
    let matches: Vec<_> = snapshot
        .mutual_matches
        .iter()
        .map(|(key, round)| serde_json::json!({"a": key.low(), "b": key.high(), "round_number": round}))
        .collect();
    Ok(HttpResponse::Ok().json(serde_json::json!({ "mutual_matches": matches })))
}

async fn post_signal(
    event_id: web::Path<String>,
    body: web::Json<SignalRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let event = try_engine!(state.registry.get(&event_id));
    let mutual = try_engine!(
        event
            .record_signal(
                body.round_number,
                &ParticipantId::new(body.from_participant.as_str()),
                &ParticipantId::new(body.to_participant.as_str()),
            )
            .await
    );
    Ok(HttpResponse::Ok().json(serde_json::json!({"success": true, "mutual": mutual})))
}

async fn admin_create_event(
    req: HttpRequest,
    body: web::Json<CreateEventRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    require_admin!(req, state);
    let body = body.into_inner();
    let roster = Roster { participants: body.participants, scores: body.scores };
    let (participants, matrix) = match roster.into_event_parts(body.check_in_all) {
        Ok(parts) => parts,
        Err(e) => return Ok(bad_request(e)),
    };
    let count = participants.len();
    try_engine!(state.registry.create_event(&body.event_id, participants, matrix).await);
    Ok(HttpResponse::Created().json(serde_json::json!({
        "success": true,
        "event_id": body.event_id,
        "participants": count,
    })))
}

async fn admin_check_in(
    req: HttpRequest,
    event_id: web::Path<String>,
    body: web::Json<CheckInRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    require_admin!(req, state);
    let body = body.into_inner();
    let walk_in = match body.registration {
        Some(registration) => {
            if let Err(e) = validate_registration(&registration) {
                return Ok(bad_request(e));
            }
            Some(registration.into_participant(Source::WalkUp))
        }
        None => None,
    };
    let event = try_engine!(state.registry.get(&event_id));
    let id = ParticipantId::new(body.participant_id);
    let registered = try_engine!(event.check_in(&id, walk_in).await);
    let pending: Vec<PairKey> = if registered {
        try_engine!(event.pending_scoring()).into_iter().filter(|k| k.contains(&id)).collect()
    } else {
        Vec::new()
    };
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "registered": registered,
        "pending_scoring": pending,
    })))
}

async fn admin_check_out(
    req: HttpRequest,
    event_id: web::Path<String>,
    body: web::Json<CheckOutRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    require_admin!(req, state);
    let event = try_engine!(state.registry.get(&event_id));
    try_engine!(event.check_out(&ParticipantId::new(body.participant_id.as_str())).await);
    Ok(HttpResponse::Ok().json(serde_json::json!({"success": true})))
}

async fn admin_advance(req: HttpRequest, event_id: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_admin!(req, state);
    let event = try_engine!(state.registry.get(&event_id));
    let outcome = try_engine!(event.advance_round().await);
    Ok(HttpResponse::Ok().json(outcome))
}

async fn admin_finish(req: HttpRequest, event_id: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_admin!(req, state);
    let event = try_engine!(state.registry.get(&event_id));
    let snapshot = try_engine!(event.finish_round().await);
    Ok(HttpResponse::Ok().json(serde_json::json!({"success": true, "status": snapshot.status})))
}

async fn admin_pause(req: HttpRequest, event_id: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_admin!(req, state);
    let event = try_engine!(state.registry.get(&event_id));
    let snapshot = try_engine!(event.pause().await);
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "status": snapshot.status,
        "remaining_secs": snapshot.timer.remaining(Utc::now()),
    })))
}

async fn admin_resume(req: HttpRequest, event_id: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_admin!(req, state);
    let event = try_engine!(state.registry.get(&event_id));
    let snapshot = try_engine!(event.resume().await);
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "status": snapshot.status,
        "remaining_secs": snapshot.timer.remaining(Utc::now()),
    })))
}

async fn admin_undo(req: HttpRequest, event_id: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_admin!(req, state);
    let event = try_engine!(state.registry.get(&event_id));
    let undone = try_engine!(event.undo_last_round().await);
    Ok(HttpResponse::Ok().json(serde_json::json!({"success": true, "undone": undone})))
}

async fn admin_swap(
    req: HttpRequest,
    event_id: web::Path<String>,
    body: web::Json<SwapRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    require_admin!(req, state);
    if let Err(e) = validate_swap(&body) {
        return Ok(bad_request(e));
    }
    let event = try_engine!(state.registry.get(&event_id));
    let round = try_engine!(
        event
            .swap_override(
                body.round_number,
                &ParticipantId::new(body.participant_a.as_str()),
                &ParticipantId::new(body.participant_b.as_str()),
            )
            .await
    );
    Ok(HttpResponse::Ok().json(round))
}

async fn admin_end(req: HttpRequest, event_id: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_admin!(req, state);
    let event = try_engine!(state.registry.get(&event_id));
    let snapshot = try_engine!(event.end_event().await);
    Ok(HttpResponse::Ok().json(serde_json::json!({"success": true, "status": snapshot.status})))
}

async fn admin_settings(
    req: HttpRequest,
    event_id: web::Path<String>,
    body: web::Json<SettingsRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    require_admin!(req, state);
    if let Err(e) = validate_settings(&body) {
        return Ok(bad_request(e));
    }
    let event = try_engine!(state.registry.get(&event_id));
    let settings = try_engine!(event.update_settings(&body.to_update()).await);
    Ok(HttpResponse::Ok().json(settings))
}

async fn admin_scores(
    req: HttpRequest,
    event_id: web::Path<String>,
    body: web::Json<ScoresRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    require_admin!(req, state);
    if let Err(e) = validate_scores(&body) {
        return Ok(bad_request(e));
    }
    let event = try_engine!(state.registry.get(&event_id));
    let entries = body
        .into_inner()
        .scores
        .into_iter()
        .map(|s| (PairKey::new(&ParticipantId::new(s.a), &ParticipantId::new(s.b)), s.score))
        .collect();
    let count = try_engine!(event.set_pair_scores(entries).await);
    let pending = try_engine!(event.pending_scoring()).len();
    Ok(HttpResponse::Ok().json(serde_json::json!({"success": true, "ingested": count, "pending": pending})))
}

async fn admin_pending_scores(
    req: HttpRequest,
    event_id: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    require_admin!(req, state);
    let event = try_engine!(state.registry.get(&event_id));
    let pending = try_engine!(event.pending_scoring());
    Ok(HttpResponse::Ok().json(serde_json::json!({ "pending": pending })))
}

async fn admin_export(req: HttpRequest, event_id: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_admin!(req, state);
    let event = try_engine!(state.registry.get(&event_id));
    let snapshot = try_engine!(event.snapshot());
    let mut out = Vec::new();
    write_rounds_csv(&snapshot, &mut out)
        .map_err(|e| actix_web::error::ErrorInternalServerError(format!("Failed to export rounds: {}", e)))?;
    Ok(HttpResponse::Ok().content_type("text/csv").body(out))
}

/// Registers every route; shared by the server and the handler tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/health", web::get().to(health))
        .route("/api/events/{id}/state", web::get().to(get_state))
        .route("/api/events/{id}/mutual-matches", web::get().to(get_mutual_matches))
        .route("/api/events/{id}/signal", web::post().to(post_signal))
        .route("/api/admin/events", web::get().to(list_events))
        .route("/api/admin/events", web::post().to(admin_create_event))
        .route("/api/admin/events/{id}/check-in", web::post().to(admin_check_in))
        .route("/api/admin/events/{id}/check-out", web::post().to(admin_check_out))
        .route("/api/admin/events/{id}/advance", web::post().to(admin_advance))
        .route("/api/admin/events/{id}/finish", web::post().to(admin_finish))
        .route("/api/admin/events/{id}/pause", web::post().to(admin_pause))
        .route("/api/admin/events/{id}/resume", web::post().to(admin_resume))
        .route("/api/admin/events/{id}/undo", web::post().to(admin_undo))
        .route("/api/admin/events/{id}/swap", web::post().to(admin_swap))
        .route("/api/admin/events/{id}/end", web::post().to(admin_end))
        .route("/api/admin/events/{id}/settings", web::post().to(admin_settings))
        .route("/api/admin/events/{id}/scores", web::post().to(admin_scores))
        .route("/api/admin/events/{id}/pending-scores", web::get().to(admin_pending_scores))
        .route("/api/admin/events/{id}/export", web::get().to(admin_export));
}

pub async fn start_server(port: u16, admin_password: String, registry: Arc<EventRegistry>) -> std::io::Result<()> {
    let app_state = web::Data::new(AppState { registry, admin_password });

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

//! HTTP server: server-rendered pages and the JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`/`POST` | `/login` | Login form / sign in |
//! | `POST` | `/logout` | Revoke the session |
//! | `GET`  | `/` | Search form |
//! | `POST` | `/search` | Search results page |
//! | `GET`  | `/equivalents?q=&standards=` | Equivalence lookup page |
//! | `GET`  | `/reports?rows=&columns=&values=&limit=` | Pivot report page |
//! | `GET`/`POST` | `/feedback` | Recent ratings and stats / rate an answer |
//! | `POST` | `/api/search` | `{ query }` → search outcome |
//! | `POST` | `/api/equivalents` | `{ material, standards? }` → equivalents |
//! | `POST` | `/api/enrich` | material record → enriched record |
//! | `POST` | `/api/validate` | `{ rows, fields? }` → validation reports |
//! | `POST` | `/api/feedback` | rate an answer |
//! | `POST` | `/api/reports/pivot` | pivot request → SQL and assembled grid |
//! | `POST` | `/api/reports/sql` | pivot request → SQL preview |
//! | `POST` | `/api/transcribe` | multipart `file` → transcript |
//! | `GET`  | `/health` | Health check (public) |
//!
//! Everything except `/login` and `/health` needs a session cookie. Without
//! one, `/api/*` answers 401 with the JSON error body (see
//! [`crate::error`]) and pages redirect to `/login`.

use anyhow::Result;
use axum::{
    extract::{
        rejection::JsonRejection, DefaultBodyLimit, FromRequestParts, Multipart, Query, State,
    },
    http::{request::Parts, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{self, SessionSigner};
use crate::config::{Config, WebhookKind};
use crate::context::AppContext;
use crate::error::{AppError, AppResult};
use crate::feedback;
use crate::materials::{self, EquivalenceOutcome, SearchOutcome};
use crate::models::{Feedback, MaterialRecord, NewFeedback, SearchKind, User};
use crate::pivot::{
    build_pivot_query, Dimension, PivotQuery, PivotRequest, PivotSchema, PivotTable, ValueSpec,
};
use crate::ui;
use crate::validate::{self, ValidateRequest, ValidationReport};

/// Largest accepted audio upload.
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// How many ratings the feedback page lists.
const FEEDBACK_PAGE_SIZE: i64 = 50;

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: AppContext,
    pub signer: Arc<SessionSigner>,
}

impl AppState {
    pub fn new(ctx: AppContext, signer: SessionSigner) -> Self {
        Self {
            ctx,
            signer: Arc::new(signer),
        }
    }
}

/// Starts the HTTP server on `[server].bind` and runs until the process ends.
pub async fn run_server(config: &Config) -> Result<()> {
    let signer = SessionSigner::new(&config.auth.session_secret()?);
    let ctx = AppContext::open(config).await?;

    for kind in WebhookKind::ALL {
        if !ctx.webhooks.is_configured(kind) {
            tracing::info!(workflow = kind.as_str(), "webhook not configured");
        }
    }

    let app = build_router(AppState::new(ctx, signer));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(addr = %config.server.bind, "PDM Assist listening");
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/login", get(login_form).post(login))
        .route("/logout", post(logout))
        .route("/", get(search_form))
        .route("/search", post(search_page))
        .route("/equivalents", get(equivalents_page))
        .route("/reports", get(reports_page))
        .route("/feedback", get(feedback_page).post(feedback_form))
        .route("/api/search", post(api_search))
        .route("/api/equivalents", post(api_equivalents))
        .route("/api/enrich", post(api_enrich))
        .route("/api/validate", post(api_validate))
        .route("/api/feedback", post(api_feedback))
        .route("/api/reports/pivot", post(api_pivot))
        .route("/api/reports/sql", post(api_pivot_sql))
        .route(
            "/api/transcribe",
            post(api_transcribe).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Sessions ============

/// The logged-in user, resolved from the session cookie.
pub struct CurrentUser {
    pub user: User,
    pub session_id: String,
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Response> {
        let jar = CookieJar::from_headers(&parts.headers);
        let found = match jar.get(&state.ctx.config.auth.cookie_name) {
            Some(cookie) => auth::lookup_session(&state.ctx.pool, &state.signer, cookie.value())
                .await
                .map_err(|e| AppError::from(e).into_response())?,
            None => None,
        };

        match found {
            Some((session, user)) => Ok(CurrentUser {
                user,
                session_id: session.id,
            }),
            None if parts.uri.path().starts_with("/api/") => {
                Err(AppError::Unauthorized("login required".to_string()).into_response())
            }
            None => Err(Redirect::to("/login").into_response()),
        }
    }
}

fn session_cookie(config: &Config, token: String) -> Cookie<'static> {
    Cookie::build((config.auth.cookie_name.clone(), token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(config.server.cookie_secure)
        .build()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Login / logout ============

#[derive(Deserialize)]
struct LoginForm {
    email: String,
    password: String,
}

async fn login_form() -> Html<String> {
    Html(ui::login_page(None, ""))
}

async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    let ctx = &state.ctx;
    let result = async {
        let user = auth::authenticate(&ctx.pool, &form.email, &form.password).await?;
        auth::create_session(&ctx.pool, &user.id, ctx.config.auth.session_ttl_hours).await
    }
    .await;

    match result {
        Ok(session) => {
            tracing::info!(user_id = %session.user_id, "login");
            let cookie = session_cookie(&ctx.config, state.signer.sign(&session.id));
            (jar.add(cookie), Redirect::to("/")).into_response()
        }
        Err(e) => {
            let (status, message) = page_error(e);
            tracing::info!(email = %form.email, %status, "login failed");
            (status, Html(ui::login_page(Some(&message), &form.email))).into_response()
        }
    }
}

async fn logout(State(state): State<AppState>, jar: CookieJar) -> AppResult<Response> {
    let name = state.ctx.config.auth.cookie_name.clone();
    if let Some(session_id) = jar
        .get(&name)
        .and_then(|c| state.signer.verify(c.value()).map(str::to_string))
    {
        auth::revoke_session(&state.ctx.pool, &session_id).await?;
    }
    let removal = Cookie::build((name, "")).path("/").build();
    Ok((jar.remove(removal), Redirect::to("/login")).into_response())
}

// ============ Pages ============

/// Splits an error into the status and message shown on a page.
fn page_error(e: anyhow::Error) -> (StatusCode, String) {
    let err = AppError::from(e);
    if err.status().is_server_error() {
        tracing::error!(code = err.code(), error = %err, "page request failed");
    }
    (err.status(), err.public_message())
}

async fn search_form(current: CurrentUser) -> Html<String> {
    Html(ui::search_page(&current.user, "", None, None))
}

#[derive(Deserialize)]
struct SearchForm {
    q: String,
}

async fn search_page(
    State(state): State<AppState>,
    current: CurrentUser,
    Form(form): Form<SearchForm>,
) -> Response {
    let user = &current.user;
    match materials::search_materials(&state.ctx, Some(&user.id), &form.q).await {
        Ok(outcome) => Html(ui::search_page(user, &form.q, Some(&outcome), None)).into_response(),
        Err(e) => {
            let (status, message) = page_error(e);
            (status, Html(ui::search_page(user, &form.q, None, Some(&message)))).into_response()
        }
    }
}

#[derive(Deserialize, Default)]
struct EquivalentsQuery {
    #[serde(default)]
    q: String,
    #[serde(default)]
    standards: String,
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

async fn equivalents_page(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<EquivalentsQuery>,
) -> Response {
    let user = &current.user;
    if query.q.trim().is_empty() {
        return Html(ui::equivalents_page(user, "", None, None)).into_response();
    }

    let standards = split_list(&query.standards);
    match materials::find_equivalents(&state.ctx, Some(&user.id), &query.q, &standards).await {
        Ok(outcome) => {
            Html(ui::equivalents_page(user, &query.q, Some(&outcome), None)).into_response()
        }
        Err(e) => {
            let (status, message) = page_error(e);
            (
                status,
                Html(ui::equivalents_page(user, &query.q, None, Some(&message))),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize, Default)]
struct ReportsQuery {
    #[serde(default)]
    rows: String,
    #[serde(default)]
    columns: String,
    #[serde(default)]
    values: String,
    #[serde(default)]
    limit: String,
}

impl ReportsQuery {
    fn is_empty(&self) -> bool {
        self.values.trim().is_empty()
    }

    fn to_request(&self) -> Result<PivotRequest> {
        let bad = |e: anyhow::Error| AppError::BadRequest(format!("{:#}", e));
        let rows = split_list(&self.rows)
            .iter()
            .map(|d| d.parse::<Dimension>())
            .collect::<Result<Vec<_>>>()
            .map_err(bad)?;
        let columns = split_list(&self.columns)
            .iter()
            .map(|d| d.parse::<Dimension>())
            .collect::<Result<Vec<_>>>()
            .map_err(bad)?;
        let values = split_list(&self.values)
            .iter()
            .map(|v| v.parse::<ValueSpec>())
            .collect::<Result<Vec<_>>>()
            .map_err(bad)?;
        let limit = match self.limit.trim() {
            "" => None,
            n => Some(n.parse::<u64>().map_err(|_| {
                AppError::BadRequest(format!("limit must be a positive number, got '{}'", n))
            })?),
        };
        Ok(PivotRequest {
            rows,
            columns,
            values,
            filters: Vec::new(),
            limit,
        })
    }

    fn form(&self) -> ui::ReportForm {
        ui::ReportForm {
            rows: self.rows.clone(),
            columns: self.columns.clone(),
            values: self.values.clone(),
            limit: self.limit.clone(),
        }
    }
}

/// Builds the statement, runs it through the report workflow, and folds
/// the rows into a grid.
async fn run_pivot(ctx: &AppContext, request: &PivotRequest) -> Result<(PivotQuery, PivotTable)> {
    let schema = PivotSchema::from_config(&ctx.config.reports);
    let query = build_pivot_query(request, &schema)?;
    let rows = ctx.webhooks.run_report(&query).await?;
    tracing::info!(rows = rows.len(), "report rows received");
    let table = PivotTable::assemble(&query, &rows)?;
    Ok((query, table))
}

async fn reports_page(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<ReportsQuery>,
) -> Response {
    let user = &current.user;
    let schema = PivotSchema::from_config(&state.ctx.config.reports);
    let form = query.form();

    if query.is_empty() || !schema.is_configured() {
        return Html(ui::reports_page(user, &schema, &form, None, None)).into_response();
    }

    let result = async {
        let request = query.to_request()?;
        run_pivot(&state.ctx, &request).await
    }
    .await;

    match result {
        Ok((pivot, table)) => Html(ui::reports_page(
            user,
            &schema,
            &form,
            Some((&pivot.sql, &table)),
            None,
        ))
        .into_response(),
        Err(e) => {
            let (status, message) = page_error(e);
            (
                status,
                Html(ui::reports_page(user, &schema, &form, None, Some(&message))),
            )
                .into_response()
        }
    }
}

async fn feedback_page(State(state): State<AppState>, current: CurrentUser) -> AppResult<Html<String>> {
    let items = feedback::list_feedback(&state.ctx.pool, FEEDBACK_PAGE_SIZE).await?;
    let stats = feedback::feedback_stats(&state.ctx.pool).await?;
    Ok(Html(ui::feedback_page(&current.user, &items, &stats)))
}

#[derive(Deserialize)]
struct FeedbackForm {
    #[serde(default)]
    kind: String,
    question: String,
    answer: String,
    rating: i64,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    back: String,
}

/// Only same-site paths are followed after rating. Browsers read `\` as
/// `/`, so `/\host` would leave the site.
fn local_path(back: &str) -> &str {
    let safe = back.starts_with('/')
        && !back.starts_with("//")
        && !back.contains('\\')
        && !back.chars().any(char::is_control);
    if safe {
        back
    } else {
        "/feedback"
    }
}

async fn feedback_form(
    State(state): State<AppState>,
    current: CurrentUser,
    Form(form): Form<FeedbackForm>,
) -> AppResult<Redirect> {
    let input = NewFeedback {
        kind: SearchKind::parse(&form.kind).unwrap_or_default(),
        question: form.question,
        answer: form.answer,
        rating: form.rating,
        comment: form.comment,
    };
    feedback::submit_feedback(&state.ctx.pool, Some(&current.user.id), input).await?;
    Ok(Redirect::to(local_path(&form.back)))
}

// ============ JSON API ============

/// Unwraps a JSON body, reporting malformed input with the error contract.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| AppError::BadRequest(e.body_text()))
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
}

async fn api_search(
    State(state): State<AppState>,
    current: CurrentUser,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> AppResult<Json<SearchOutcome>> {
    let req = json_body(payload)?;
    let outcome = materials::search_materials(&state.ctx, Some(&current.user.id), &req.query).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct EquivalentsRequest {
    material: String,
    #[serde(default)]
    standards: Vec<String>,
}

async fn api_equivalents(
    State(state): State<AppState>,
    current: CurrentUser,
    payload: Result<Json<EquivalentsRequest>, JsonRejection>,
) -> AppResult<Json<EquivalenceOutcome>> {
    let req = json_body(payload)?;
    let outcome = materials::find_equivalents(
        &state.ctx,
        Some(&current.user.id),
        &req.material,
        &req.standards,
    )
    .await?;
    Ok(Json(outcome))
}

async fn api_enrich(
    State(state): State<AppState>,
    _current: CurrentUser,
    payload: Result<Json<MaterialRecord>, JsonRejection>,
) -> AppResult<Json<MaterialRecord>> {
    let record = json_body(payload)?;
    Ok(Json(materials::enrich(&state.ctx, &record).await?))
}

#[derive(Serialize)]
struct ValidateResponse {
    reports: Vec<ValidationReport>,
}

async fn api_validate(
    State(state): State<AppState>,
    current: CurrentUser,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> AppResult<Json<ValidateResponse>> {
    let req = json_body(payload)?;
    let reports = validate::validate_rows(&state.ctx, Some(&current.user.id), &req).await?;
    Ok(Json(ValidateResponse { reports }))
}

async fn api_feedback(
    State(state): State<AppState>,
    current: CurrentUser,
    payload: Result<Json<NewFeedback>, JsonRejection>,
) -> AppResult<(StatusCode, Json<Feedback>)> {
    let input = json_body(payload)?;
    let stored = feedback::submit_feedback(&state.ctx.pool, Some(&current.user.id), input).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

#[derive(Serialize)]
struct PivotResponse {
    sql: String,
    table: PivotTable,
}

async fn api_pivot(
    State(state): State<AppState>,
    _current: CurrentUser,
    payload: Result<Json<PivotRequest>, JsonRejection>,
) -> AppResult<Json<PivotResponse>> {
    let request = json_body(payload)?;
    let (query, table) = run_pivot(&state.ctx, &request).await?;
    Ok(Json(PivotResponse {
        sql: query.sql,
        table,
    }))
}

async fn api_pivot_sql(
    State(state): State<AppState>,
    _current: CurrentUser,
    payload: Result<Json<PivotRequest>, JsonRejection>,
) -> AppResult<Json<PivotQuery>> {
    let request = json_body(payload)?;
    let schema = PivotSchema::from_config(&state.ctx.config.reports);
    Ok(Json(build_pivot_query(&request, &schema)?))
}

async fn api_transcribe(
    State(state): State<AppState>,
    _current: CurrentUser,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("audio").to_string();
        let mime = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;

        let text = state
            .ctx
            .webhooks
            .transcribe(bytes.to_vec(), &filename, &mime)
            .await?;
        return Ok(Json(json!({ "text": text })));
    }

    Err(AppError::BadRequest("multipart field 'file' is required".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("/equivalents"), "/equivalents");
        assert_eq!(local_path("//evil.example"), "/feedback");
        assert_eq!(local_path("https://evil.example"), "/feedback");
        assert_eq!(local_path(""), "/feedback");
        assert_eq!(local_path("/\\evil.example"), "/feedback");
        assert_eq!(local_path("/search\\..\\x"), "/feedback");
        assert_eq!(local_path("/search\r\nLocation: x"), "/feedback");
    }

    #[test]
    fn test_reports_query_to_request() {
        let query = ReportsQuery {
            rows: "plant, created_at:month".to_string(),
            columns: String::new(),
            values: "sum:quantity, count".to_string(),
            limit: "100".to_string(),
        };
        let req = query.to_request().unwrap();
        assert_eq!(req.rows.len(), 2);
        assert_eq!(req.rows[1].alias(), "created_at_month");
        assert_eq!(req.values[1].alias(), "count_all");
        assert_eq!(req.limit, Some(100));

        let bad = ReportsQuery {
            values: "sum:quantity".to_string(),
            limit: "lots".to_string(),
            ..Default::default()
        };
        let err: AppError = bad.to_request().unwrap_err().into();
        assert_eq!(err.code(), "bad_request");
    }
}

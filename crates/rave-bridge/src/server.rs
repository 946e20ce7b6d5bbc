use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use rave_core::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::agents::{AgentController, AgentControllerConfig, OperationResult};
use crate::audit::{AuditConfig, AuditEvent, AuditEventType, AuditLogger};
use crate::auth::{IdentityValidator, UserInfo, CAP_START, CAP_STATUS, CAP_STOP};
use crate::breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker};
use crate::command::{CommandParser, ParsedCommand};
use crate::config::BridgeConfig;
use crate::metrics::BridgeMetrics;
use crate::ratelimit::{RateLimitConfig, RateLimiter, RequestContext};

/// Shared state for every request handler.
pub struct BridgeState {
    pub config: BridgeConfig,
    pub parser: CommandParser,
    pub validator: IdentityValidator,
    pub controller: AgentController,
    pub audit: Arc<AuditLogger>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: BreakerRegistry,
    pub idp_breaker: Arc<CircuitBreaker>,
    pub systemd_breaker: Arc<CircuitBreaker>,
    pub metrics: BridgeMetrics,
    pub http: reqwest::Client,
}

impl BridgeState {
    /// Wire every component from the loaded config.
    pub fn build(config: BridgeConfig, validator: IdentityValidator) -> Result<Arc<Self>> {
        let parser = CommandParser::new(Some(&config.allowed_commands))?;
        let controller = AgentController::new(AgentControllerConfig {
            allowed_services: config.allowed_agent_services.clone(),
            service_prefix: config.agent_service_prefix.clone(),
            ..AgentControllerConfig::default()
        })?;
        let audit = AuditLogger::new(AuditConfig {
            log_file: config.audit_log_file.clone(),
            hmac_key: config.audit_key_bytes()?,
            ..AuditConfig::default()
        })?;
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: config.rate_limit_rpm,
            burst_size: config.rate_limit_burst,
            ..RateLimitConfig::default()
        });

        let breakers = BreakerRegistry::new();
        // systemd failures are resource/transient shaped; auth failures are
        // the expected trip condition for the IdP breaker.
        let systemd_breaker = breakers.create(
            "systemd_controller",
            BreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(60),
                ..BreakerConfig::default()
            },
            |e| matches!(e, Error::Transient(_) | Error::Resource(_)),
        );
        let idp_breaker = breakers.create(
            "oidc_validator",
            BreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(300),
                ..BreakerConfig::default()
            },
            |e| matches!(e, Error::Transient(_)),
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Arc::new(Self {
            parser,
            validator,
            controller,
            audit,
            limiter,
            breakers,
            idp_breaker,
            systemd_breaker,
            metrics: BridgeMetrics::new()?,
            http,
            config,
        }))
    }

    /// Start background tasks (rate-limiter cleanup, audit flush).
    pub fn start_background_tasks(&self) {
        Arc::clone(&self.limiter).start();
        Arc::clone(&self.audit).start();
        self.audit.log(
            AuditEvent::new(AuditEventType::ServiceStart)
                .details(json!({"host": self.config.host, "port": self.config.port})),
        );
    }

    /// Stop background tasks and flush the audit trail.
    pub fn shutdown(&self) {
        self.limiter.stop();
        self.audit
            .log_sync(AuditEvent::new(AuditEventType::ServiceStop));
        self.audit.close();
    }
}

/// Build the bridge router with the security middleware installed.
pub fn router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/_matrix/app/v1/transactions/:txn_id", put(handle_transactions))
        .route("/_matrix/app/v1/users/:user_id", get(handle_user_query))
        .route("/_matrix/app/v1/rooms/:room_alias", get(handle_room_query))
        .route("/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            security_middleware,
        ))
        .with_state(state)
}

/// Serve until the shutdown future resolves.
pub async fn serve(state: Arc<BridgeState>, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .map_err(|e| Error::validation(format!("invalid listen address: {e}")))?;

    state.start_background_tasks();
    let app = router(Arc::clone(&state));

    info!(%addr, "bridge listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::resource(format!("failed to bind {addr}: {e}")))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| Error::internal(format!("server error: {e}")))?;

    state.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------
// Security middleware

const PUBLIC_PATHS: [&str; 2] = ["/health", "/metrics"];

async fn security_middleware(
    State(state): State<Arc<BridgeState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let headers = request.headers().clone();
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    // 1. Size cap by declared length; axum enforces the body read too.
    if let Some(length) = content_length(&headers) {
        if length > state.config.max_request_size {
            return validation_failure(&state, &client_ip, user_agent, &path, "request too large")
                .await;
        }
    }

    // 2. Rate limit by client address.
    if !state
        .limiter
        .is_allowed(&client_ip, 1, RequestContext::default())
        .await
    {
        state.metrics.auth_failures.with_label_values(&["rate_limit"]).inc();
        state.audit.log(
            AuditEvent::new(AuditEventType::RateLimitExceeded)
                .client(client_ip.clone(), user_agent)
                .details(json!({"endpoint": path})),
        );
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }

    // 3. Appservice token for non-public paths.
    if !PUBLIC_PATHS.contains(&path.as_str()) {
        let token = bearer_token(&headers);
        if token.as_deref() != Some(state.config.as_token.as_str()) {
            state
                .metrics
                .auth_failures
                .with_label_values(&["invalid_token"])
                .inc();
            let prefix: String = token
                .as_deref()
                .unwrap_or("")
                .chars()
                .take(8)
                .collect();
            state.audit.log(
                AuditEvent::new(AuditEventType::InvalidAuth)
                    .client(client_ip.clone(), user_agent)
                    .details(json!({"token_prefix": prefix, "endpoint": path})),
            );
            return (StatusCode::UNAUTHORIZED, "Invalid appservice token").into_response();
        }
    }

    // 4. Content type for POSTs.
    if method == axum::http::Method::POST {
        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("application/json")
            && !content_type.starts_with("application/x-www-form-urlencoded")
        {
            return validation_failure(&state, &client_ip, user_agent, &path, "invalid content type")
                .await;
        }
    }

    let response = next.run(request).await;

    // 5. Request metrics on the way out.
    state
        .metrics
        .requests
        .with_label_values(&[
            method.as_str(),
            &path,
            response.status().as_str(),
        ])
        .inc();
    state
        .metrics
        .request_duration
        .with_label_values(&[])
        .observe(start.elapsed().as_secs_f64());

    response
}

async fn validation_failure(
    state: &BridgeState,
    client_ip: &str,
    user_agent: Option<String>,
    path: &str,
    reason: &str,
) -> Response {
    state
        .metrics
        .auth_failures
        .with_label_values(&["validation_error"])
        .inc();
    state.audit.log(
        AuditEvent::new(AuditEventType::SecurityValidationFailed)
            .client(client_ip.to_string(), user_agent)
            .details(json!({"error": reason, "endpoint": path})),
    );
    (StatusCode::BAD_REQUEST, reason.to_string()).into_response()
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

// ---------------------------------------------------------------------
// Matrix appservice endpoints

#[derive(Debug, Deserialize)]
struct Transaction {
    events: Vec<Value>,
}

async fn handle_transactions(
    State(state): State<Arc<BridgeState>>,
    Path(txn_id): Path<String>,
    body: String,
) -> Response {
    let transaction: Transaction = match serde_json::from_str(&body) {
        Ok(t) => t,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response(),
    };

    info!(txn_id = %txn_id, events = transaction.events.len(), "processing transaction");
    for event in &transaction.events {
        if let Err(e) = process_event(&state, event).await {
            error!(error = %e, event_id = %event["event_id"], "failed to process event");
        }
    }
    Json(json!({})).into_response()
}

async fn handle_user_query(Path(_user_id): Path<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"errcode": "M_NOT_FOUND", "error": "User not found"})),
    )
        .into_response()
}

async fn handle_room_query(Path(_room_alias): Path<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"errcode": "M_NOT_FOUND", "error": "Room not found"})),
    )
        .into_response()
}

/// Act on one room event: filter, authenticate, parse, execute, reply.
async fn process_event(state: &Arc<BridgeState>, event: &Value) -> Result<()> {
    if event["type"] != "m.room.message" || event["content"]["msgtype"] != "m.text" {
        return Ok(());
    }
    let body = event["content"]["body"].as_str().unwrap_or("").trim();
    if !body.starts_with('!') {
        return Ok(());
    }
    let sender = event["sender"].as_str().unwrap_or("");
    let room_id = event["room_id"].as_str().unwrap_or("");

    let reply = handle_command(state, sender, Some(room_id), body).await;
    post_matrix_reply(state, room_id, &reply).await;
    Ok(())
}

// ---------------------------------------------------------------------
// Webhook endpoint

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    token: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    user_name: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    text: String,
}

async fn handle_webhook(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let payload: WebhookPayload = if content_type.starts_with("application/json") {
        match serde_json::from_str(&body) {
            Ok(p) => p,
            Err(_) => return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response(),
        }
    } else {
        match parse_form_payload(&body) {
            Ok(p) => p,
            Err(_) => return (StatusCode::BAD_REQUEST, "Invalid form payload").into_response(),
        }
    };

    if payload.token != state.config.hs_token {
        state
            .metrics
            .auth_failures
            .with_label_values(&["invalid_webhook_token"])
            .inc();
        return (StatusCode::UNAUTHORIZED, "Invalid webhook token").into_response();
    }

    let text = payload.text.trim();
    if !text.starts_with('!') {
        return Json(json!({"text": ""})).into_response();
    }

    let subject = if payload.user_id.is_empty() {
        payload.user_name.clone()
    } else {
        payload.user_id.clone()
    };
    let reply = handle_command(&state, &subject, Some(&payload.channel_id), text).await;
    Json(json!({"text": reply})).into_response()
}

// Forms carry only flat string fields; a tiny decoder avoids pulling in a
// dedicated urlencoded dependency.
fn parse_form_payload(body: &str) -> Result<WebhookPayload> {
    let mut payload = WebhookPayload {
        token: String::new(),
        user_id: String::new(),
        user_name: String::new(),
        channel_id: String::new(),
        text: String::new(),
    };
    for pair in body.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = url_decode(value)?;
        match key {
            "token" => payload.token = value,
            "user_id" => payload.user_id = value,
            "user_name" => payload.user_name = value,
            "channel_id" => payload.channel_id = value,
            "text" => payload.text = value,
            _ => {}
        }
    }
    Ok(payload)
}

fn url_decode(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                if i + 2 >= bytes.len() {
                    return Err(Error::validation("truncated percent escape"));
                }
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .map_err(|_| Error::validation("bad percent escape"))?;
                out.push(
                    u8::from_str_radix(hex, 16)
                        .map_err(|_| Error::validation("bad percent escape"))?,
                );
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).map_err(|_| Error::validation("form value is not UTF-8"))
}

// ---------------------------------------------------------------------
// Command pipeline

/// Run the full command pipeline for one inbound message, returning the
/// user-facing reply text.
async fn handle_command(
    state: &Arc<BridgeState>,
    sender: &str,
    room_id: Option<&str>,
    body: &str,
) -> String {
    info!(sender, command = %truncate(body, 50), "processing command");

    // 1. Authenticate through the IdP breaker.
    let user = match state
        .idp_breaker
        .call(state.validator.validate_user(sender))
        .await
    {
        Ok(user) => user,
        Err(Error::CircuitOpen { .. }) => {
            return "⚠️ Service temporarily unavailable".to_string();
        }
        Err(e @ (Error::Authentication(_) | Error::Authorization(_))) => {
            state
                .metrics
                .commands
                .with_label_values(&[first_word(body), "auth_failed", sender])
                .inc();
            state.audit.log(
                AuditEvent::new(AuditEventType::CommandAuthFailed)
                    .user(sender)
                    .room(room_id.unwrap_or(""))
                    .details(json!({"error": e.to_string(), "command": truncate(body, 100)})),
            );
            return format!("❌ Authentication failed: {e}");
        }
        Err(e) => {
            error!(error = %e, sender, "identity validation error");
            return "❌ Authentication failed".to_string();
        }
    };

    // 2. Parse.
    let parsed = match state.parser.parse(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            state
                .metrics
                .commands
                .with_label_values(&[first_word(body), "validation_failed", sender])
                .inc();
            return format!("❌ Invalid command: {e}");
        }
    };

    // 3. Audit the attempt.
    state.audit.log(
        AuditEvent::new(AuditEventType::CommandAttempt)
            .user(sender)
            .room(room_id.unwrap_or(""))
            .details(json!({
                "command": parsed.command,
                "args": parsed.args,
                "user_groups": user.groups,
            })),
    );

    // 4. Execute through the systemd breaker.
    let result = execute_command(state, &parsed, &user).await;

    match result {
        Ok(result) => {
            state
                .metrics
                .commands
                .with_label_values(&[
                    &parsed.command,
                    if result.success { "success" } else { "failed" },
                    sender,
                ])
                .inc();
            state.audit.log(
                AuditEvent::new(if result.success {
                    AuditEventType::CommandSuccess
                } else {
                    AuditEventType::CommandFailed
                })
                .user(sender)
                .room(room_id.unwrap_or(""))
                .details(json!({"command": parsed.command, "message": result.message})),
            );
            format_reply(&result)
        }
        Err(Error::CircuitOpen { .. }) => "⚠️ Service temporarily unavailable".to_string(),
        Err(e @ Error::Authorization(_)) => {
            state.audit.log(
                AuditEvent::new(AuditEventType::PermissionDenied)
                    .user(sender)
                    .room(room_id.unwrap_or(""))
                    .details(json!({"command": parsed.command, "error": e.to_string()})),
            );
            format!("❌ {e}")
        }
        Err(e) => {
            state
                .metrics
                .commands
                .with_label_values(&[&parsed.command, "failed", sender])
                .inc();
            state.audit.log(
                AuditEvent::new(AuditEventType::CommandFailed)
                    .user(sender)
                    .room(room_id.unwrap_or(""))
                    .details(json!({"command": parsed.command, "error": e.to_string()})),
            );
            error!(error = %e, command = %parsed.command, "command execution failed");
            "❌ Command execution failed".to_string()
        }
    }
}

fn require_capability(user: &UserInfo, capability: &str) -> Result<()> {
    if user.has_capability(capability) {
        return Ok(());
    }
    Err(Error::authorization(format!(
        "user '{}' lacks capability {capability}",
        user.username
    )))
}

async fn execute_command(
    state: &Arc<BridgeState>,
    parsed: &ParsedCommand,
    user: &UserInfo,
) -> Result<OperationResult> {
    match parsed.command.as_str() {
        "start-agent" => {
            require_capability(user, CAP_START)?;
            let agent = parsed
                .args
                .first()
                .ok_or_else(|| Error::validation("agent type required for start-agent"))?
                .clone();
            let result = state
                .systemd_breaker
                .call(run_controller(state, "start", agent.clone()))
                .await?;
            state
                .metrics
                .systemd_operations
                .with_label_values(&[
                    "start",
                    &agent,
                    if result.success { "success" } else { "failed" },
                ])
                .inc();
            Ok(result)
        }
        "stop-agent" => {
            require_capability(user, CAP_STOP)?;
            let agent = parsed
                .args
                .first()
                .ok_or_else(|| Error::validation("agent type required for stop-agent"))?
                .clone();
            let result = state
                .systemd_breaker
                .call(run_controller(state, "stop", agent.clone()))
                .await?;
            state
                .metrics
                .systemd_operations
                .with_label_values(&[
                    "stop",
                    &agent,
                    if result.success { "success" } else { "failed" },
                ])
                .inc();
            Ok(result)
        }
        "status-agent" => {
            require_capability(user, CAP_STATUS)?;
            let agent = parsed
                .args
                .first()
                .ok_or_else(|| Error::validation("agent type required for status-agent"))?
                .clone();
            state
                .systemd_breaker
                .call(run_controller(state, "status", agent))
                .await
        }
        "list-agents" => {
            require_capability(user, CAP_STATUS)?;
            let filter = parsed.args.first().cloned();
            state
                .systemd_breaker
                .call(async {
                    Ok(state.controller.list_agents(filter.as_deref()).await)
                })
                .await
        }
        "help" => Ok(help_result(state, parsed.args.first().map(String::as_str))),
        other => Err(Error::validation(format!("unknown command: {other}"))),
    }
}

async fn run_controller(
    state: &Arc<BridgeState>,
    operation: &str,
    agent: String,
) -> Result<OperationResult> {
    let result = match operation {
        "start" => state.controller.start_agent(&agent).await,
        "stop" => state.controller.stop_agent(&agent).await,
        "status" => state.controller.get_status(&agent).await,
        _ => return Err(Error::internal(format!("unknown operation {operation}"))),
    };
    Ok(result)
}

fn help_result(state: &Arc<BridgeState>, command: Option<&str>) -> OperationResult {
    let (message, details) = match command {
        Some(name) => match state.parser.command_help(name) {
            Some(help) => (
                format!("{}: {}", help.command, help.description),
                json!({"usage": help.usage}),
            ),
            None => (
                format!("unknown command: {name}"),
                json!({}),
            ),
        },
        None => {
            let commands = state.parser.allowed_commands();
            let listing: Vec<String> = commands
                .iter()
                .map(|(name, desc)| format!("!{name} - {desc}"))
                .collect();
            ("available commands".to_string(), json!({"commands": listing}))
        }
    };
    OperationResult {
        success: true,
        message,
        details,
        timestamp: rave_core::time::unix_now(),
        duration: 0.0,
    }
}

/// Render an operation result as a chat reply: status prefix plus a
/// details block with memory values as MB and summaries flattened.
fn format_reply(result: &OperationResult) -> String {
    let mut message = if result.success {
        format!("✅ {}", result.message)
    } else {
        format!("❌ {}", result.message)
    };

    if let Some(details) = result.details.as_object() {
        if !details.is_empty() {
            let mut lines = Vec::new();
            for (key, value) in details {
                lines.push(format!("{key}: {}", render_detail(key, value)));
            }
            message.push_str("\n\n📊 Details:\n");
            message.push_str(&lines.join("\n"));
        }
    }
    message
}

fn render_detail(key: &str, value: &Value) -> String {
    match (key, value) {
        ("memory_usage", Value::Number(n)) => {
            let bytes = n.as_f64().unwrap_or(0.0);
            format!("{:.0}MB", bytes / (1024.0 * 1024.0))
        }
        ("summary", Value::Object(map)) => map
            .iter()
            .map(|(k, v)| format!("{k}: {}", plain(v)))
            .collect::<Vec<_>>()
            .join(", "),
        (_, v) => plain(v),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

async fn post_matrix_reply(state: &Arc<BridgeState>, room_id: &str, message: &str) {
    let txn = uuid::Uuid::new_v4();
    let url = format!(
        "{}/_matrix/client/r0/rooms/{room_id}/send/m.room.message/{txn}",
        state.config.homeserver_url.trim_end_matches('/')
    );
    let result = state
        .http
        .put(&url)
        .bearer_auth(&state.config.as_token)
        .json(&json!({"msgtype": "m.text", "body": message}))
        .send()
        .await;
    match result {
        Ok(response) if !response.status().is_success() => {
            error!(status = %response.status(), room_id, "failed to send chat reply");
        }
        Err(e) => {
            error!(error = %e, room_id, "error sending chat reply");
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------
// Health + metrics

async fn handle_health(State(state): State<Arc<BridgeState>>) -> Response {
    let components: Vec<Value> = state
        .breakers
        .health_all()
        .into_iter()
        .map(|h| json!({"name": h.name, "state": h.state}))
        .collect();
    let degraded = state.breakers.any_open();

    let body = json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": rave_core::time::unix_now(),
        "components": components,
    });

    if degraded {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    } else {
        Json(body).into_response()
    }
}

async fn handle_metrics(State(state): State<Arc<BridgeState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "metrics rendering failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

fn first_word(body: &str) -> &str {
    body.split_whitespace().next().unwrap_or("unknown")
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, IdpDirectory, IdpUser};
    use axum::body::to_bytes;
    use tower::ServiceExt;

    struct StaticDirectory;

    #[async_trait::async_trait]
    impl IdpDirectory for StaticDirectory {
        async fn lookup_user(&self, username: &str) -> rave_core::Result<IdpUser> {
            if username == "ghost" {
                return Err(Error::authentication("user not found: ghost"));
            }
            Ok(IdpUser {
                id: 1,
                username: username.to_string(),
                email: format!("{username}@example.com"),
                name: "Test".into(),
                state: "active".into(),
                created_at: String::new(),
            })
        }

        async fn user_groups(&self, _user_id: i64) -> rave_core::Result<Vec<String>> {
            Ok(vec!["platform-admins".to_string()])
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> BridgeConfig {
        toml::from_str(&format!(
            r#"
            idp_url = "https://idp.invalid"
            oidc_client_id = "client"
            oidc_client_secret = "secret"
            homeserver_url = "http://127.0.0.1:1"
            as_token = "as-token"
            hs_token = "hs-token"
            rate_limit_rpm = 600
            rate_limit_burst = 100
            audit_log_file = "{}"
            "#,
            dir.path().join("audit.log").display()
        ))
        .unwrap()
    }

    fn state(dir: &tempfile::TempDir) -> Arc<BridgeState> {
        let config = test_config(dir);
        let validator = IdentityValidator::new(
            AuthConfig {
                idp_url: config.idp_url.clone(),
                client_id: config.oidc_client_id.clone(),
                client_secret: config.oidc_client_secret.clone(),
                ..AuthConfig::default()
            },
            Box::new(StaticDirectory),
        )
        .unwrap();
        BridgeState::build(config, validator).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint_healthy() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health_degraded_when_breaker_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = state(&dir);
        s.systemd_breaker.force_open();
        let app = router(Arc::clone(&s));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_is_public() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_transactions_require_token() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/_matrix/app/v1/transactions/txn1")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"events\":[]}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_transactions_with_token_and_no_commands() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/_matrix/app/v1/transactions/txn1")
                    .header("authorization", "Bearer as-token")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"events":[{"type":"m.room.member","content":{}}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_oversize_request_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/_matrix/app/v1/transactions/txn1")
                    .header("authorization", "Bearer as-token")
                    .header("content-type", "application/json")
                    .header("content-length", (10 * 1024 * 1024).to_string())
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_token() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("authorization", "Bearer as-token")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"token":"wrong","user_id":"alice","text":"!help"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_help_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("authorization", "Bearer as-token")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"token":"hs-token","user_id":"alice","channel_id":"chan","text":"!help"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let text = body["text"].as_str().unwrap();
        assert!(text.starts_with('✅'), "{text}");
        assert!(text.contains("!start-agent"));
    }

    #[tokio::test]
    async fn test_webhook_form_encoding() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("authorization", "Bearer as-token")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(
                        "token=hs-token&user_id=alice&channel_id=chan&text=%21help+start-agent",
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["text"].as_str().unwrap().contains("start-agent"));
    }

    #[tokio::test]
    async fn test_webhook_invalid_command_reports_validation() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("authorization", "Bearer as-token")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"token":"hs-token","user_id":"alice","channel_id":"chan","text":"!start-agent agent; rm -rf /"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        let text = body["text"].as_str().unwrap();
        assert!(text.starts_with('❌'), "{text}");
        assert!(text.contains("Invalid command"));
    }

    #[tokio::test]
    async fn test_unknown_user_gets_auth_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("authorization", "Bearer as-token")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"token":"hs-token","user_id":"ghost","channel_id":"chan","text":"!help"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["text"].as_str().unwrap().contains("Authentication failed"));
    }

    #[test]
    fn test_format_reply_memory_and_summary() {
        let result = OperationResult {
            success: true,
            message: "status retrieved".into(),
            details: json!({
                "memory_usage": 52428800,
                "summary": {"total": 3, "active": 1},
                "state": "active",
            }),
            timestamp: 0.0,
            duration: 0.1,
        };
        let reply = format_reply(&result);
        assert!(reply.starts_with("✅ status retrieved"));
        assert!(reply.contains("📊 Details:"));
        assert!(reply.contains("memory_usage: 50MB"));
        assert!(reply.contains("active: 1"));
        assert!(reply.contains("state: active"));
    }

    #[test]
    fn test_format_reply_failure_prefix() {
        let result = OperationResult {
            success: false,
            message: "agent x failed to start".into(),
            details: json!({}),
            timestamp: 0.0,
            duration: 0.1,
        };
        assert!(format_reply(&result).starts_with('❌'));
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("%21help+me").unwrap(), "!help me");
        assert_eq!(url_decode("plain").unwrap(), "plain");
        assert!(url_decode("%zz").is_err());
    }
}

use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ipnet::Ipv4Net;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    config::{self, ScannerConfig},
    error::LanWatchError,
    ports, probe,
    scheduler::ScanScheduler,
    store::HostMetadata,
    types::{PortScanType, ScanEvent},
};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: ScanScheduler,
    /// Applied to every scheduler started over the API.
    pub cycle_deadline: Option<Duration>,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub network: Option<String>,
    pub port_start: Option<u32>,
    pub port_end: Option<u32>,
    pub timeout: Option<u64>,
    pub interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PortScanRequest {
    pub host: Option<String>,
    #[serde(default)]
    pub scan_type: PortScanType,
    pub start_port: Option<u32>,
    pub end_port: Option<u32>,
    pub timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct BannerRequest {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct HostUpdateRequest {
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub dns_name: Option<String>,
    pub is_dhcp: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct MacLookupRequest {
    pub host: Option<String>,
}

/// Maps domain failures onto status codes.
pub struct ApiError(LanWatchError);

impl From<LanWatchError> for ApiError {
    fn from(e: LanWatchError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self.0 {
            LanWatchError::Validation(_) => StatusCode::BAD_REQUEST,
            LanWatchError::NotFound(_) => StatusCode::NOT_FOUND,
            LanWatchError::Store(_) | LanWatchError::StoreCorrupt(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (code, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

fn invalid(msg: impl Into<String>) -> ApiError {
    ApiError(LanWatchError::Validation(msg.into()))
}

fn parse_host(host: Option<String>) -> std::result::Result<Ipv4Addr, ApiError> {
    let host = host.ok_or_else(|| invalid("host is required"))?;
    host.trim()
        .parse()
        .map_err(|_| invalid(format!("invalid IPv4 host: {host}")))
}

fn secs(v: Option<f64>, default: f64) -> Duration {
    Duration::try_from_secs_f64(v.unwrap_or(default)).unwrap_or(Duration::from_secs_f64(default))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/scan", get(get_scan))
        .route("/scanner/status", get(get_scanner_status))
        .route("/scanner/start", post(post_start))
        .route("/scanner/pause", post(post_pause))
        .route("/scanner/resume", post(post_resume))
        .route("/scanner/stop", post(post_stop))
        .route("/command/portscan", post(post_portscan))
        .route("/command/bannergrab", post(post_bannergrab))
        .route("/command/maclookup", post(post_maclookup))
        .route("/host/update", post(post_host_update))
        .route("/ws", get(get_ws))
        .with_state(state)
}

/// Serve the API under `/api`, static UI files as the fallback.
pub async fn serve(bind: &str, state: AppState, ui_dir: PathBuf) -> Result<()> {
    let static_svc = ServeDir::new(ui_dir).append_index_html_on_directories(true);
    let app = Router::new()
        .nest("/api", router(state))
        .fallback_service(static_svc)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("serving control surface on http://{}", bind);
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

/// Broadcast a registry snapshot every `every`, independent of the scan interval.
pub async fn push_snapshots(scheduler: ScanScheduler, every: Duration) {
    let mut tick = tokio::time::interval(every);
    loop {
        tick.tick().await;
        if scheduler.events().receiver_count() == 0 {
            continue;
        }
        let snap = scheduler.registry().snapshot().await;
        let _ = scheduler.events().send(ScanEvent::ScanUpdate(snap));
    }
}

async fn get_scan(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.scheduler.registry().snapshot().await)
}

async fn get_scanner_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.scheduler.status())
}

async fn post_start(State(app): State<AppState>, Json(req): Json<StartRequest>) -> ApiResult {
    let network = req
        .network
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| invalid("Network parameter is required"))?;
    let net: Ipv4Net = network
        .trim()
        .parse()
        .map_err(|e| invalid(format!("invalid CIDR: {e}")))?;
    let cfg = ScannerConfig::new(
        net,
        req.port_start.unwrap_or(config::DEFAULT_PORT_START),
        req.port_end.unwrap_or(config::DEFAULT_PORT_END),
        Duration::from_secs(req.timeout.unwrap_or(config::DEFAULT_TIMEOUT_SECS)),
        Duration::from_secs(req.interval.unwrap_or(config::DEFAULT_INTERVAL_SECS)),
    )?
    .with_cycle_deadline(app.cycle_deadline);
    app.scheduler.start(cfg);
    Ok(Json(json!({ "status": "scanner started", "network": network })).into_response())
}

async fn post_pause(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "scanner paused", "state": app.scheduler.pause() }))
}

async fn post_resume(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "scanner resumed", "state": app.scheduler.resume() }))
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "scanner stopped", "state": app.scheduler.stop() }))
}

async fn post_portscan(State(app): State<AppState>, Json(req): Json<PortScanRequest>) -> ApiResult {
    let host = parse_host(req.host)?;
    let port_list = ports::ports_for_scan(req.scan_type, req.start_port, req.end_port)?;
    let timeout = secs(req.timeout, 1.0);

    let scheduler = app.scheduler.clone();
    tokio::spawn(async move {
        scheduler.scan_host_now(host, &port_list, timeout).await;
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "Port scan started", "host": host.to_string() })),
    )
        .into_response())
}

async fn post_bannergrab(Json(req): Json<BannerRequest>) -> ApiResult {
    let host = req
        .host
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| invalid("host and port are required"))?;
    let port = req
        .port
        .filter(|&p| p != 0)
        .ok_or_else(|| invalid("host and port are required"))?;
    let outcome = probe::grab_banner(host.trim(), port, secs(req.timeout, 5.0)).await;
    debug!(%host, port, status = outcome.status(), "banner grab");
    Ok(Json(json!({
        "host": host,
        "port": port,
        "banner": outcome.legacy_text(),
        "status": outcome.status(),
    }))
    .into_response())
}

async fn post_host_update(State(app): State<AppState>, Json(req): Json<HostUpdateRequest>) -> ApiResult {
    let ip = req
        .ip
        .filter(|ip| !ip.trim().is_empty())
        .ok_or_else(|| invalid("IP is required"))?;
    let meta = HostMetadata {
        hostname: req.hostname,
        dns_name: req.dns_name,
        is_dhcp: req.is_dhcp,
    };
    let host = app.scheduler.registry().update_metadata(ip.trim(), &meta).await?;
    Ok(Json(json!({
        "status": "Host updated",
        "ip": host.ip,
        "hostname": host.hostname,
        "dns_name": host.dns_name,
        "is_dhcp": host.is_dhcp,
    }))
    .into_response())
}

async fn post_maclookup(State(app): State<AppState>, Json(req): Json<MacLookupRequest>) -> ApiResult {
    let ip = req
        .host
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| invalid("host is required"))?;
    let ip = ip.trim();
    let registry = app.scheduler.registry();
    let mac = registry.mac_of(ip).await?;
    if mac.is_empty() {
        return Err(ApiError(LanWatchError::NotFound(format!("no MAC known for {ip}"))));
    }
    let vendor = app.scheduler.discovery().vendors().refresh(&mac).await;
    registry.set_vendor(ip, &vendor).await?;
    Ok(Json(json!({ "host": ip, "vendor": vendor })).into_response())
}

async fn get_ws(State(app): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = app.scheduler.events().subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

async fn forward_events(mut socket: WebSocket, mut rx: broadcast::Receiver<ScanEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(ev) => ev,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "websocket listener lagging");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let text = match serde_json::to_string(&event) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to encode event");
                continue;
            }
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

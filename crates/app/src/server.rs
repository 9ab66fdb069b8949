//! Actix Web server exposing live frames, daily statistics and health.
//!
//! The server runs on a dedicated thread so camera workers never share a
//! runtime with HTTP handling. Store queries hop onto the blocking pool.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, info};
use traffic_core::{
    CameraConfig, FrameBroadcaster, MULTIPART_CONTENT_TYPE, StatsAggregator, WorkerStatus,
    WorkerSupervisor, multipart_part, stats_date,
};

use crate::telemetry;

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) cameras: Arc<Vec<CameraConfig>>,
    pub(crate) supervisor: Arc<WorkerSupervisor>,
    pub(crate) stats: Arc<StatsAggregator>,
    pub(crate) broadcaster: Arc<FrameBroadcaster>,
    pub(crate) stream_interval: Duration,
}

impl ServerState {
    fn knows(&self, camera_id: &str) -> bool {
        self.cameras
            .iter()
            .any(|camera| camera.camera_id == camera_id)
    }
}

#[derive(Default)]
/// Handle for the server thread.
pub(crate) struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

#[derive(Deserialize)]
struct StatsQuery {
    date: Option<String>,
}

#[derive(Serialize)]
struct CameraEntry<'a> {
    camera_id: &'a str,
    line_ratio: f64,
    pixel_to_distance: f64,
    has_frame: bool,
    status: Option<WorkerStatus>,
}

/// Spawn the server thread and return a handle that can stop it.
pub(crate) fn spawn_api_server(bind: SocketAddr, state: ServerState) -> Result<ApiServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("http-server".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(state.clone()))
                        .configure(routes)
                })
                .bind(bind)?
                .run();
                info!("HTTP server listening on {bind}");

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("HTTP server error: {err}");
            }
        })
        .context("Failed to spawn HTTP server thread")?;
    Ok(ApiServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(cameras_handler))
        .route("/cameras", web::get().to(cameras_handler))
        .route("/video_feed/{camera_id}", web::get().to(stream_handler))
        .route("/frame/{camera_id}", web::get().to(frame_handler))
        .route("/stats/{camera_id}", web::get().to(stats_handler))
        .route("/health", web::get().to(health_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

fn unknown_camera(camera_id: &str) -> HttpResponse {
    HttpResponse::NotFound().json(json!({ "error": format!("unknown camera {camera_id}") }))
}

/// List configured cameras with their worker status.
async fn cameras_handler(state: web::Data<ServerState>) -> HttpResponse {
    let entries: Vec<CameraEntry<'_>> = state
        .cameras
        .iter()
        .map(|camera| CameraEntry {
            camera_id: &camera.camera_id,
            line_ratio: camera.line_ratio,
            pixel_to_distance: camera.pixel_to_distance,
            has_frame: state.broadcaster.latest(&camera.camera_id).is_some(),
            status: state.supervisor.status(&camera.camera_id),
        })
        .collect();
    HttpResponse::Ok().json(entries)
}

/// Return the latest annotated JPEG for a camera.
async fn frame_handler(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let camera_id = path.into_inner();
    if !state.knows(&camera_id) {
        return unknown_camera(&camera_id);
    }
    match state.broadcaster.latest(&camera_id) {
        Some(frame) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .append_header(("X-Frame-Number", frame.frame_number.to_string()))
            .body(frame.jpeg.clone()),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream the MJPEG feed of a camera over a multipart response.
async fn stream_handler(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let camera_id = path.into_inner();
    if !state.knows(&camera_id) {
        return unknown_camera(&camera_id);
    }

    let broadcaster = state.broadcaster.clone();
    let cadence = state.stream_interval;
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(cadence);
        loop {
            interval.tick().await;
            if let Some(frame) = broadcaster.latest(&camera_id) {
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(multipart_part(&frame)));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", MULTIPART_CONTENT_TYPE))
        .streaming(stream)
}

/// Daily totals for a camera; `?date=YYYY-MM-DD` defaults to today.
async fn stats_handler(
    path: web::Path<String>,
    query: web::Query<StatsQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let camera_id = path.into_inner();
    if !state.knows(&camera_id) {
        return unknown_camera(&camera_id);
    }
    let date = match query.date.as_deref() {
        None => stats_date(),
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => {
                return HttpResponse::BadRequest()
                    .json(json!({ "error": format!("invalid date {raw:?}; expected YYYY-MM-DD") }));
            }
        },
    };

    let stats = state.stats.clone();
    match web::block(move || stats.query(&camera_id, date)).await {
        Ok(Ok(snapshot)) => HttpResponse::Ok().json(snapshot),
        Ok(Err(err)) => {
            error!("stats query failed: {err}");
            HttpResponse::ServiceUnavailable().json(json!({ "error": err.to_string() }))
        }
        Err(err) => HttpResponse::InternalServerError().json(json!({ "error": err.to_string() })),
    }
}

async fn health_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "cameras": state.cameras.len(),
        "active_workers": state.supervisor.active_count(),
    }))
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

//! Actix Web preview server exposing the live camera feed and service status.
//!
//! The server runs on a dedicated thread with its own Actix system so the
//! capture hot path never touches the async runtime.

use std::{net::TcpListener, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    middleware::DefaultHeaders,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::error;

use crate::{
    serve::data::{SharedFrame, SharedStatus},
    telemetry,
};

/// Body served on `/` so probes can tell the backend is up.
pub(crate) const INDEX_BODY: &str = "Rust Backend Running";
/// Interval between MJPEG parts, roughly 30 fps.
const STREAM_INTERVAL: Duration = Duration::from_millis(33);

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) frames: SharedFrame,
    pub(crate) status: SharedStatus,
}

#[derive(Default)]
/// Handle for the preview server thread.
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
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

/// Bind `addr` on the caller's thread, then serve from a dedicated thread.
pub(crate) fn spawn_preview_server(addr: &str, state: ServerState) -> Result<PreviewServer> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("Failed to bind preview server on {addr}"))?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = telemetry::spawn_thread("preview-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .wrap(cors_headers())
                    .configure(configure_routes)
            })
            .workers(1)
            .listen(listener)?
            .run();

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
    .context("Failed to spawn preview server thread")?;

    Ok(PreviewServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Browser dashboards load the feed cross-origin.
pub(crate) fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
}

pub(crate) fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/video_feed", web::get().to(video_feed_handler))
        .route("/status", web::get().to(status_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(INDEX_BODY)
}

/// Return the latest JPEG frame, or 204 while the camera has produced nothing.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.frames.get() {
        Some(packet) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .append_header(("X-Sequence", packet.frame_number.to_string()))
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream the MJPEG feed over a multipart response.
async fn video_feed_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(STREAM_INTERVAL);
        let mut last_sent: Option<u64> = None;
        loop {
            interval.tick().await;
            if let Some(part) = next_mjpeg_part(&state.frames, &mut last_sent) {
                yield Ok::<Bytes, actix_web::Error>(part);
            }
        }
    };

    HttpResponse::Ok()
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .content_type("multipart/x-mixed-replace; boundary=frame")
        .streaming(stream)
}

/// Next multipart chunk, or `None` when nothing new was published since
/// `last_sent`. Keyed on the slot's update count because frame numbers start
/// over whenever the pipeline restarts.
fn next_mjpeg_part(frames: &SharedFrame, last_sent: &mut Option<u64>) -> Option<Bytes> {
    let (packet, sequence) = frames.latest()?;
    if *last_sent == Some(sequence) {
        return None;
    }
    *last_sent = Some(sequence);

    let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(&packet.jpeg);
    payload.extend_from_slice(b"\r\n");
    Some(Bytes::from(payload))
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.status.snapshot(&state.frames))
}

/// Prometheus exposition, or 503 when no recorder was installed.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

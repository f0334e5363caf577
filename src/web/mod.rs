//! Web front-end for submitting downloads and watching the log.
//!
//! ## Endpoints
//!
//! - `GET /` - Redirects to `/gallery-dl`
//! - `GET /gallery-dl` - Submit form with a live log view
//! - `POST /gallery-dl/q` - Queue a download (form fields `url`, `video-opts`)
//! - `GET /gallery-dl/logs` - The full log as a page
//! - `POST /gallery-dl/logs/clear` - Truncate the log file
//! - `GET /stream/logs` - The full log as plain text
//! - `WS /ws/logs` - Live log tail
//! - `GET /static/{style.css,app.js}` - Page assets
//!
//! Every response carries a `Content-Security-Policy` header, and `POST`
//! routes accept cross-origin requests.

pub mod registry;
mod websocket;

use std::io;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{Form, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::job::{DownloadMode, RequestOptions};
use crate::tail;

const INDEX_HTML: &str = include_str!("assets/index.html");
const LOGS_HTML: &str = include_str!("assets/logs.html");
const STYLE_CSS: &str = include_str!("assets/style.css");
const APP_JS: &str = include_str!("assets/app.js");

pub const CSP_POLICY: &str = concat!(
    "default-src 'self'; ",
    "connect-src 'self'; ",
    "form-action 'self'; ",
    "manifest-src 'self'; ",
    "img-src 'self' data:; ",
    "script-src 'self' https://cdn.jsdelivr.net; ",
    "style-src 'self' https://cdn.jsdelivr.net https://fonts.googleapis.com; ",
    "font-src 'self' https://cdn.jsdelivr.net https://fonts.gstatic.com;",
);

/// Web server for the front-end.
pub struct WebServer {
    bind_addr: SocketAddr,
    ctx: AppContext,
}

impl WebServer {
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        Self { bind_addr, ctx }
    }

    /// Bind and serve until shutdown starts.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown starts.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Web front-end listening");

        let shutdown = self.ctx.shutdown.token();
        axum::serve(listener, router(self.ctx.clone()))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(redirect))
        .route("/gallery-dl", get(serve_index))
        .route("/gallery-dl/q", post(submit))
        .route("/gallery-dl/logs", get(logs_page))
        .route("/gallery-dl/logs/clear", post(clear_logs))
        .route("/stream/logs", get(stream_logs))
        .route("/ws/logs", get(websocket::ws_handler))
        .route("/static/style.css", get(style_css))
        .route("/static/app.js", get(app_js))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CSP_POLICY),
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::POST]),
        )
        .with_state(ctx)
}

async fn style_css() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], STYLE_CSS)
}

async fn app_js() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/javascript; charset=utf-8")], APP_JS)
}

async fn redirect() -> Redirect {
    Redirect::temporary("/gallery-dl")
}

async fn serve_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Deserialize)]
struct SubmitForm {
    url: Option<String>,
    #[serde(rename = "video-opts")]
    video_opts: Option<String>,
}

async fn submit(
    State(ctx): State<AppContext>,
    Form(form): Form<SubmitForm>,
) -> Json<serde_json::Value> {
    let url = form.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() {
        error!("No URL provided.");
        return Json(json!({
            "success": false,
            "error": "/q called without a 'url' in form data",
        }));
    }

    let mode = match form.video_opts.as_deref().unwrap_or_default().parse() {
        Ok(mode) => mode,
        Err(e) => {
            warn!("{e}; using the default mode");
            DownloadMode::NoneSelected
        }
    };
    let options = RequestOptions { mode };

    ctx.jobs.submit(url.to_string(), options.clone());
    info!("Added URL to the download queue: {url}");

    Json(json!({
        "success": true,
        "url": url,
        "options": options,
    }))
}

async fn logs_page(State(ctx): State<AppContext>) -> Html<String> {
    let logs = tail::snapshot(&ctx.config.log_file()).await;
    Html(LOGS_HTML.replace("{{logs}}", &escape_html(&logs)))
}

async fn clear_logs(State(ctx): State<AppContext>) -> (StatusCode, Json<serde_json::Value>) {
    match ctx.log_writer.clear().await {
        Ok(()) => {
            info!("Cleared the log file");
            (
                StatusCode::OK,
                Json(json!({"success": true, "message": "Logs successfully cleared."})),
            )
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "Log file not found."})),
        ),
        Err(e) => {
            debug!(error = %e, "Failed to clear log file");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": "An error occurred while accessing the log file.",
                })),
            )
        }
    }
}

async fn stream_logs(State(ctx): State<AppContext>) -> Response {
    let body = Body::from_stream(tail::stream(ctx.config.log_file()));
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_in_log_lines() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn logs_page_has_a_placeholder() {
        assert!(LOGS_HTML.contains("{{logs}}"));
    }

    #[test]
    fn pages_have_no_inline_scripts_or_styles() {
        for page in [INDEX_HTML, LOGS_HTML] {
            assert!(!page.contains("<script>"));
            assert!(!page.contains("<style>"));
            assert!(page.contains(r#"<script src="/static/app.js" defer></script>"#));
        }
    }
}

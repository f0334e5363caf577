//! HTTP and WebSocket routes against a server on an ephemeral port.
#![cfg(unix)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gdl_server::config::{AppConfig, DownloaderConfig};
use gdl_server::context::AppContext;
use gdl_server::job::{JobRunner, Launcher, Supervisor};
use gdl_server::logging::{FileSink, Level, LogRecord, LogWriter, Sinks};
use gdl_server::shutdown::DrainConnections;
use gdl_server::web::{CSP_POLICY, WebServer};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

struct TestServer {
    addr: SocketAddr,
    ctx: AppContext,
    log_file: PathBuf,
    _dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn wait_for_log(&self, needle: &str) -> String {
        timeout(Duration::from_secs(20), async {
            loop {
                let content = std::fs::read_to_string(&self.log_file).unwrap_or_default();
                if content.contains(needle) {
                    return content;
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("timeout waiting for log line")
    }
}

async fn start_server(script: &str) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        log_dir: dir.path().join("logs"),
        tail_interval_ms: 20,
        downloader: DownloaderConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..DownloaderConfig::default()
        },
        ..AppConfig::default()
    };

    let log_file = config.log_file();
    let writer =
        LogWriter::spawn(Sinks::new().with_file(FileSink::open(&log_file).unwrap())).unwrap();
    let launcher = Launcher::with_worker_exe(
        env!("CARGO_BIN_EXE_gdl-server"),
        config.downloader.clone(),
        Level::Info,
    );
    let supervisor = Supervisor::new(Arc::new(writer.clone()), Level::Info)
        .with_poll_interval(Duration::from_millis(100));

    let ctx = AppContext::new(config, writer, JobRunner::new(launcher, supervisor));
    ctx.shutdown.add_hook(DrainConnections::new(ctx.registry.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = WebServer::new(ctx.clone(), addr);
    tokio::spawn(async move { server.serve(listener).await });

    TestServer {
        addr,
        ctx,
        log_file,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_root_redirects_to_index() {
    let server = start_server("exit 0").await;

    let response = reqwest::get(server.url("/")).await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(response.url().path(), "/gallery-dl");
    assert!(response.text().await.unwrap().contains("<form"));
}

#[tokio::test]
async fn test_responses_carry_security_headers() {
    let server = start_server("exit 0").await;

    for path in ["/gallery-dl", "/gallery-dl/logs", "/static/app.js", "/stream/logs"] {
        let response = reqwest::get(server.url(path)).await.unwrap();
        assert!(response.status().is_success(), "{path}");
        assert_eq!(
            response.headers()["content-security-policy"],
            CSP_POLICY,
            "{path}"
        );
    }

    let style = reqwest::get(server.url("/static/style.css")).await.unwrap();
    assert!(
        style.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/css")
    );

    let response = reqwest::Client::new()
        .post(server.url("/gallery-dl/q"))
        .header("origin", "http://elsewhere.example")
        .form(&[("url", "")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn test_submit_without_url_is_rejected() {
    let server = start_server("exit 0").await;

    let body: Value = reqwest::Client::new()
        .post(server.url("/gallery-dl/q"))
        .form(&[("video-opts", "download-video")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "/q called without a 'url' in form data");
}

#[tokio::test]
async fn test_submit_runs_download_in_background() {
    let server = start_server(r#"echo "* saved $0""#).await;

    let body: Value = reqwest::Client::new()
        .post(server.url("/gallery-dl/q"))
        .form(&[("url", " https://example.com/a "), ("video-opts", "extract-audio")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["url"], "https://example.com/a");
    assert_eq!(body["options"]["video-options"], "extract-audio");

    let content = server
        .wait_for_log("Download process exited successfully")
        .await;
    assert!(content.contains("Download successful: saved https://example.com/a"));
}

#[tokio::test]
async fn test_logs_page_stream_and_clear() {
    let server = start_server("exit 0").await;

    let page = reqwest::get(server.url("/gallery-dl/logs"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(page.contains("No logs to display."));

    server
        .ctx
        .log_writer
        .emit(LogRecord::new(Level::Info, "test", "<b>hello</b>"));
    server.ctx.log_writer.flush().await;

    let page = reqwest::get(server.url("/gallery-dl/logs"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(page.contains("[info] &lt;b&gt;hello&lt;/b&gt;"));

    let raw = reqwest::get(server.url("/stream/logs"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(raw.trim_end().ends_with("[info] <b>hello</b>"));

    let response = reqwest::Client::new()
        .post(server.url("/gallery-dl/logs/clear"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Logs successfully cleared.");
    assert_eq!(std::fs::read_to_string(&server.log_file).unwrap(), "");
}

#[tokio::test]
async fn test_websocket_tails_log_and_closes_on_shutdown() {
    let server = start_server("exit 0").await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/logs", server.addr))
        .await
        .expect("websocket connect");

    timeout(Duration::from_secs(5), async {
        while server.ctx.registry.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber registered");
    // Let the handler position its cursor at the end of the file.
    sleep(Duration::from_millis(200)).await;

    server
        .ctx
        .log_writer
        .emit(LogRecord::new(Level::Info, "test", "Downloading a.jpg"));

    let text = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected websocket event: {other:?}"),
            }
        }
    })
    .await
    .expect("timeout waiting for log update");
    assert!(text.ends_with("[info] Downloading a.jpg\n"));

    assert!(server.ctx.shutdown.trigger("test").await);
    assert!(!server.ctx.shutdown.trigger("test again").await);

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(server.ctx.registry.is_empty());
}

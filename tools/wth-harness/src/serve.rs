//! Test page server
//!
//! Serves the module under test and the test page with the headers browsers
//! require for `SharedArrayBuffer` and module workers. The page reports its
//! result by posting a [`TestReport`] to `/exit`.
//!
//! | Path           | Served                                  |
//! |----------------|-----------------------------------------|
//! | `/target.wasm` | the module under test (ranges allowed)  |
//! | `/exit`        | `POST` the report, accepted once        |
//! | anything else  | files from the web directory            |

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::post,
    Json, Router,
};
use tokio::sync::{oneshot, Mutex};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{error, info, warn};
use wth_host::TestReport;

/// Page the browser should open.
pub const TEST_PAGE: &str = "run-test.html";

/// Where the page's `exitTest` result goes. Only the first report counts.
#[derive(Clone)]
pub struct ExitSlot(Arc<Mutex<Option<oneshot::Sender<TestReport>>>>);

impl ExitSlot {
    pub fn channel() -> (Self, oneshot::Receiver<TestReport>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }
}

pub struct ServeOptions {
    pub module: PathBuf,
    pub web_dir: PathBuf,
    pub port: u16,
    pub headful: bool,
    pub timeout: Option<Duration>,
}

pub fn router(module: &Path, web_dir: &Path, exit: ExitSlot) -> Router {
    Router::new()
        .route_service("/target.wasm", ServeFile::new(module))
        .route("/exit", post(exit_test))
        .fallback_service(ServeDir::new(web_dir))
        .layer(middleware::from_fn(add_headers))
        .with_state(exit)
}

/// Serve until the page reports (or forever with `headful`).
///
/// Fails before binding when the module or the test page is missing.
pub async fn serve(opts: ServeOptions) -> anyhow::Result<TestReport> {
    tokio::fs::metadata(&opts.module)
        .await
        .with_context(|| format!("module {} not readable", opts.module.display()))?;
    let page = opts.web_dir.join(TEST_PAGE);
    if !tokio::fs::try_exists(&page).await.unwrap_or(false) {
        bail!(
            "test page {} not found (set --web-dir to the directory holding {TEST_PAGE})",
            page.display()
        );
    }

    let (exit, report_rx) = ExitSlot::channel();
    let app = router(&opts.module, &opts.web_dir, exit);

    let addr = SocketAddr::from(([127, 0, 0, 1], opts.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let port = listener.local_addr()?.port();
    let url = format!("http://localhost:{port}/{TEST_PAGE}");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "server stopped");
        }
    });

    let report = if opts.headful {
        println!("Please visit {url}");
        println!("Press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
        TestReport::pass()
    } else {
        info!(%url, module = %opts.module.display(), "waiting for test page");
        let reported = async {
            report_rx
                .await
                .map_err(|_| anyhow!("report channel closed"))
        };
        match opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, reported).await {
                Ok(report) => report?,
                Err(_) => {
                    warn!(?limit, "test page never reported");
                    TestReport::fail(format!("no result after {}s", limit.as_secs()))
                }
            },
            None => reported.await?,
        }
    };

    server.abort();
    Ok(report)
}

async fn exit_test(State(exit): State<ExitSlot>, Json(report): Json<TestReport>) -> StatusCode {
    match exit.0.lock().await.take() {
        Some(tx) => {
            info!(passed = report.passed, "test page reported");
            // Receiver only goes away on shutdown
            let _ = tx.send(report);
            StatusCode::NO_CONTENT
        }
        None => {
            warn!("duplicate report ignored");
            StatusCode::CONFLICT
        }
    }
}

/// Add cross-origin isolation headers and fix MIME types
async fn add_headers(request: Request<Body>, next: Next) -> Response<Body> {
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;
    let is_success = response.status().is_success();
    let headers = response.headers_mut();

    // Required for SharedArrayBuffer
    headers.insert(
        "Cross-Origin-Opener-Policy",
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        "Cross-Origin-Embedder-Policy",
        HeaderValue::from_static("require-corp"),
    );

    let content_type = if path.ends_with(".js") || path.ends_with(".mjs") {
        Some("text/javascript; charset=utf-8")
    } else if path.ends_with(".wasm") {
        Some("application/wasm")
    } else if path.ends_with(".html") {
        Some("text/html; charset=utf-8")
    } else {
        None
    };
    if let (Some(content_type), true) = (content_type, is_success) {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tower::ServiceExt;

    const WASM: &[u8] = b"\0asm\x01\0\0\0";

    struct Fixture {
        dir: tempfile::TempDir,
        app: Router,
        report_rx: oneshot::Receiver<TestReport>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("case.wasm");
        std::fs::write(&module, WASM).unwrap();
        let web = dir.path().join("web");
        std::fs::create_dir(&web).unwrap();
        std::fs::write(web.join(TEST_PAGE), "<!doctype html>").unwrap();
        std::fs::write(web.join("run-test.mjs"), "export {}").unwrap();

        let (exit, report_rx) = ExitSlot::channel();
        Fixture {
            app: router(&module, &web, exit),
            dir,
            report_rx,
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_exit(json: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/exit")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_target_wasm_is_served_isolated() {
        let fx = fixture();
        let response = fx.app.oneshot(get("/target.wasm")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["cross-origin-opener-policy"], "same-origin");
        assert_eq!(headers["cross-origin-embedder-policy"], "require-corp");
        assert_eq!(headers[header::CONTENT_TYPE], "application/wasm");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], WASM);
    }

    #[tokio::test]
    async fn test_target_wasm_supports_ranges() {
        let fx = fixture();
        let request = Request::builder()
            .uri("/target.wasm")
            .header(header::RANGE, "bytes=0-3")
            .body(Body::empty())
            .unwrap();
        let response = fx.app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"\0asm");
    }

    #[tokio::test]
    async fn test_page_scripts_get_module_mime_type() {
        let fx = fixture();
        let response = fx.app.oneshot(get("/run-test.mjs")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/javascript; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_missing_file_still_isolated() {
        let fx = fixture();
        let response = fx.app.oneshot(get("/nope.html")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()["cross-origin-embedder-policy"],
            "require-corp"
        );
    }

    #[tokio::test]
    async fn test_exit_accepts_first_report_only() {
        let fx = fixture();

        let first = fx
            .app
            .clone()
            .oneshot(post_exit(r#"{"passed": false, "error": "thread 3 missing"}"#))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::NO_CONTENT);

        let second = fx
            .app
            .oneshot(post_exit(r#"{"passed": true}"#))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        assert_eq!(
            fx.report_rx.await.unwrap(),
            TestReport::fail("thread 3 missing")
        );
    }

    #[tokio::test]
    async fn test_exit_rejects_malformed_report() {
        let fx = fixture();
        let response = fx.app.oneshot(post_exit(r#"{"ok": 1}"#)).await.unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_serve_times_out_without_report() {
        let fx = fixture();
        let report = serve(ServeOptions {
            module: fx.dir.path().join("case.wasm"),
            web_dir: fx.dir.path().join("web"),
            port: 0,
            headful: false,
            timeout: Some(Duration::from_millis(100)),
        })
        .await
        .unwrap();

        assert!(!report.passed);
    }

    #[tokio::test]
    async fn test_serve_requires_test_page() {
        let fx = fixture();
        std::fs::remove_file(fx.dir.path().join("web").join(TEST_PAGE)).unwrap();

        let err = serve(ServeOptions {
            module: fx.dir.path().join("case.wasm"),
            web_dir: fx.dir.path().join("web"),
            port: 0,
            headful: false,
            timeout: None,
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains(TEST_PAGE));
    }

    #[tokio::test]
    async fn test_serve_requires_module() {
        let fx = fixture();
        let result = serve(ServeOptions {
            module: fx.dir.path().join("missing.wasm"),
            web_dir: fx.dir.path().join("web"),
            port: 0,
            headful: false,
            timeout: None,
        })
        .await;

        assert!(result.is_err());
    }
}

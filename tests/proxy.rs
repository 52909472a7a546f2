use axum::{
    Router,
    body::{Body, to_bytes},
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode, header},
    response::Response,
};
use imagens::{
    config::{BackendConfig, Environment},
    models::upload::UploadResponse,
    proxy::{
        ProxyState,
        config::{Period, ProxyConfig, RateLimitConfig},
        router,
    },
    routes::routes::routes,
    state::AppState,
};
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

const INDEX_HTML: &str = "<!doctype html><html><body><div id=\"app\">imagens</div></body></html>";
const JPEG_BYTES: &[u8] = b"\xFF\xD8\xFF\xE0proxied-jpeg\xFF\xD9";
const CLIENT: ([u8; 4], u16) = ([198, 51, 100, 7], 40000);

struct Fixture {
    proxy: Router,
    _static_root: TempDir,
    _images_root: TempDir,
}

/// Start a real backend on loopback and build a proxy router in front of it.
async fn fixture(tweak: impl FnOnce(&mut ProxyConfig)) -> Fixture {
    let images_root = TempDir::new().unwrap();
    let backend = routes(AppState::new(BackendConfig {
        images_root: images_root.path().to_path_buf(),
        environment: Environment::Production,
        ..BackendConfig::default()
    }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, backend).await.unwrap();
    });

    let static_root = TempDir::new().unwrap();
    std::fs::write(static_root.path().join("index.html"), INDEX_HTML).unwrap();
    std::fs::create_dir_all(static_root.path().join("assets")).unwrap();
    std::fs::write(
        static_root.path().join("assets/app.3f9a1c.js"),
        "console.log('imagens');\n".repeat(200),
    )
    .unwrap();

    let mut config = ProxyConfig::for_deployment(8080, backend_port, static_root.path());
    tweak(&mut config);
    config.validate().unwrap();

    let proxy = router(ProxyState::new(config).unwrap())
        .layer(MockConnectInfo(SocketAddr::from(CLIENT)));
    Fixture {
        proxy,
        _static_root: static_root,
        _images_root: images_root,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::HOST, "fotos.local")
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

fn upload(registro: &str, ponto: &str) -> Request<Body> {
    let boundary = "proxy-boundary";
    let mut body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"registro\"\r\n\r\n{r}\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"ponto\"\r\n\r\n{p}\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"x.jpg\"\r\n\
         Content-Type: image/jpeg\r\n\r\n",
        b = boundary,
        r = registro,
        p = ponto
    )
    .into_bytes();
    body.extend_from_slice(JPEG_BYTES);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(header::HOST, "fotos.local")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn static_frontend_with_spa_fallback_and_security_headers() {
    let f = fixture(|_| {}).await;

    for path in ["/", "/batches/12/pontos"] {
        let response = f.proxy.clone().oneshot(get(path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", path);
        let headers = response.headers();
        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-xss-protection"], "1; mode=block");
        assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
        assert!(headers.get(header::CACHE_CONTROL).is_none());
        assert_eq!(body_bytes(response).await, INDEX_HTML.as_bytes());
    }
}

#[tokio::test]
async fn fingerprinted_assets_are_cached_and_compressed() {
    let f = fixture(|_| {}).await;
    let mut request = get("/assets/app.3f9a1c.js");
    request
        .headers_mut()
        .insert(header::ACCEPT_ENCODING, "gzip".parse().unwrap());

    let response = f.proxy.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "public, max-age=31536000, immutable"
    );
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
}

#[tokio::test]
async fn upload_and_fetch_through_the_proxy() {
    let f = fixture(|_| {}).await;

    let response = f.proxy.clone().oneshot(upload("batch1", "foto")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let uploaded: UploadResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(uploaded.path, "batch1/foto.jpg");
    assert_eq!(uploaded.link, "http://fotos.local:8080/imagens/batch1/foto.jpg");

    let response = f
        .proxy
        .clone()
        .oneshot(get("/imagens/batch1/foto.jpg"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "public, max-age=86400");
    assert_eq!(response.headers()["x-frame-options"], "SAMEORIGIN");
    assert_eq!(body_bytes(response).await, JPEG_BYTES);
}

#[tokio::test]
async fn outer_proxy_host_is_linked_without_the_listen_port() {
    let f = fixture(|_| {}).await;
    let mut request = upload("batch1", "foto");
    let headers = request.headers_mut();
    headers.insert("x-forwarded-proto", "https".parse().unwrap());
    headers.insert("x-forwarded-host", "example.com".parse().unwrap());

    let response = f.proxy.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let uploaded: UploadResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(uploaded.link, "https://example.com/imagens/batch1/foto.jpg");
}

#[tokio::test]
async fn api_prefix_is_stripped_before_forwarding() {
    let f = fixture(|_| {}).await;

    let response = f.proxy.clone().oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["service"], "upload-service");

    let response = f.proxy.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_requests_beyond_the_burst_are_rejected() {
    let f = fixture(|config| {
        config.api_limit = RateLimitConfig {
            requests: 1,
            per: Period::Minute,
            burst: 2,
        };
    })
    .await;

    for _ in 0..3 {
        let response = f.proxy.clone().oneshot(get("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = f.proxy.clone().oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Liveness and static files draw from no budget.
    let response = f.proxy.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = f.proxy.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn oversized_bodies_are_refused_at_the_edge() {
    let f = fixture(|config| config.max_body_mb = 1).await;
    let body = vec![0u8; 2 * 1024 * 1024];
    let request = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(header::HOST, "fotos.local")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap();

    let response = f.proxy.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn unreachable_backend_is_a_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = closed.local_addr().unwrap().port();
    drop(closed);

    let f = fixture(|config| config.backend = format!("http://127.0.0.1:{}", dead_port)).await;
    let response = f.proxy.clone().oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

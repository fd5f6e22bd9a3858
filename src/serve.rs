use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use vigilare_core::AppConfig;
use vigilare_search::{RateLimiter, SearchEngine};
use vigilare_storage::{CrawlStore, DataPaths, SearchStore};

const FAVICON_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

struct AppState {
    engine: SearchEngine,
    rate: RateLimiter,
    icons_dir: PathBuf,
    http: reqwest::Client,
}

pub async fn run_server(config: AppConfig) -> Result<()> {
    let paths = DataPaths::new(&config.data_dir());
    paths.ensure_dirs()?;

    // A fresh deployment may be queried before the crawler or indexer has
    // run; create empty schemas so read-only pools can open.
    ensure_databases(&paths).await?;

    let store = SearchStore::open_reader(&paths.search_db(), &paths.crawl_db()).await?;
    let state = Arc::new(AppState {
        engine: SearchEngine::new(store),
        rate: RateLimiter::new(),
        icons_dir: paths.icons_dir(),
        http: reqwest::Client::builder().timeout(FAVICON_FETCH_TIMEOUT).build()?,
    });

    let app = Router::new()
        .route("/", get(home))
        .route("/search", get(search))
        .route("/suggest", get(suggest))
        .route("/icon/{domain}", get(icon))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(addr = %config.server.bind, "search server listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn ensure_databases(paths: &DataPaths) -> Result<()> {
    if !paths.search_db().exists() {
        let store = SearchStore::open_writer(&paths.search_db()).await?;
        store.migrate().await?;
        store.close().await;
    }
    if !paths.crawl_db().exists() {
        let store = CrawlStore::open_writer(&paths.crawl_db()).await?;
        store.migrate().await?;
        store.close().await;
    }
    Ok(())
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Vigilare</title></head>
<body>
<h1>Vigilare</h1>
<form action="/search" method="get">
<input type="text" name="q" autofocus>
<button type="submit">Search</button>
</form>
</body>
</html>
"#;

async fn home() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    page: Option<usize>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Response {
    if !state.rate.check(addr.ip()) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded. Try again later.")
            .into_response();
    }

    let q = params.q.unwrap_or_default();
    let page = params.page.unwrap_or(1);
    let user_lang = accept_language_primary(&headers);

    let response = state.engine.search(&q, page, &user_lang).await;
    Json(response).into_response()
}

#[derive(Deserialize)]
struct SuggestParams {
    q: Option<String>,
}

async fn suggest(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SuggestParams>,
) -> Json<Vec<String>> {
    let q = params.q.unwrap_or_default();
    Json(state.engine.suggest(&q).await)
}

/// Disk-cached favicon proxy. Misses are fetched from the Google favicon
/// service and cached; failures are a plain 404.
async fn icon(State(state): State<Arc<AppState>>, Path(domain): Path<String>) -> Response {
    let domain: String = domain
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .take(50)
        .collect();
    if domain.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let cache_path = state.icons_dir.join(format!("{domain}.ico"));
    if let Ok(bytes) = tokio::fs::read(&cache_path).await {
        return icon_response(bytes);
    }

    let remote = format!("https://www.google.com/s2/favicons?domain={domain}&sz=32");
    match state.http.get(&remote).send().await {
        Ok(resp) if resp.status().as_u16() == 200 => match resp.bytes().await {
            Ok(bytes) => {
                let _ = tokio::fs::write(&cache_path, &bytes).await;
                icon_response(bytes.to_vec())
            }
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn icon_response(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], bytes).into_response()
}

/// First tag of the Accept-Language header: `en-US,en;q=0.9` → `en-US`.
fn accept_language_primary(headers: &HeaderMap) -> String {
    headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("en")
        .to_string()
}

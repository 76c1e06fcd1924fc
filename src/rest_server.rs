use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use http::{header, Method, StatusCode, Uri};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::metrics::StationReport;
use crate::mqtt_service::{BrokerManager, ClientState};
use crate::publisher::ChangeTracker;
use crate::service_utils::{publish_station_info, publish_status};

const BODY_LIMIT: usize = 64 * 1024;

/// Request counters shown on the info page.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub hits: AtomicU64,
    pub reports: AtomicU64,
    pub incomplete_reports: AtomicU64,
    pub broker_errors: AtomicU64,
    pub forward_errors: AtomicU64,
}

/// Everything a request handler needs; lives as long as the server.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broker: Arc<BrokerManager>,
    pub tracker: Arc<ChangeTracker>,
    pub forwarder: Option<Forwarder>,
    pub stats: Arc<ServerStats>,
}

impl AppState {
    pub fn new(config: Arc<Config>, broker: Arc<BrokerManager>, forwarder: Option<Forwarder>) -> Self {
        Self {
            config,
            broker,
            tracker: Arc::new(ChangeTracker::new()),
            forwarder,
            stats: Arc::new(ServerStats::default()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .with_state(state)
}

/// Run the HTTP listener until `shutdown` resolves.
pub async fn run_rest_server<F>(state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(state.config.http_addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Response {
    state.stats.hits.fetch_add(1, Ordering::Relaxed);

    if !uri.path().contains(state.config.proxy_path.as_str()) {
        return info_page(&state).await;
    }

    if method != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, "telemetry must be sent with GET").into_response();
    }

    let params = match query {
        Ok(Query(params)) => params,
        Err(e) => {
            warn!("Unreadable query string '{}': {}", uri.query().unwrap_or(""), e);
            HashMap::new()
        }
    };

    ingest(&state, &uri, &params).await
}

/// Handles one station report: publish what changed, then answer the station.
async fn ingest(state: &AppState, uri: &Uri, params: &HashMap<String, String>) -> Response {
    state.stats.reports.fetch_add(1, Ordering::Relaxed);
    let report = StationReport::extract(params);
    if report.missing_required().next().is_some() {
        state.stats.incomplete_reports.fetch_add(1, Ordering::Relaxed);
    }

    match state.broker.ensure_connected().await {
        Ok(session) => {
            publish_status(session.as_ref(), &state.config, true).await;
            publish_station_info(session.as_ref(), &state.config, &report).await;

            let summary = state
                .tracker
                .publish_report(session.as_ref(), &state.config, &report)
                .await;
            if state.config.verbose {
                info!(
                    "Station report: {} published, {} unchanged, {} skipped, {} failed.",
                    summary.published, summary.unchanged, summary.skipped, summary.failed
                );
            }
        }
        Err(e) => {
            state.stats.broker_errors.fetch_add(1, Ordering::Relaxed);
            error!("Station report not published to MQTT: {}", e);
        }
    }

    match &state.forwarder {
        Some(forwarder) => {
            let request_uri = uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or_else(|| uri.path());
            match forwarder.forward(request_uri).await {
                Ok(body) => {
                    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
                }
                Err(e) => {
                    state.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                    error!("{}", e);
                    (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
                }
            }
        }
        None => {
            debug!("Forwarding disabled, acknowledging locally.");
            (StatusCode::OK, "success").into_response()
        }
    }
}

async fn info_page(state: &AppState) -> Response {
    let broker_state = state.broker.state().await;
    match render_info_page(&state.config, &state.stats, &broker_state) {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            error!("Failed to render info page: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn render_info_page(
    config: &Config,
    stats: &ServerStats,
    broker_state: &ClientState,
) -> Result<String, std::fmt::Error> {
    let mut page = String::new();
    writeln!(page, "<!DOCTYPE html><html><body><center>")?;
    writeln!(page, "<h2>observer-bridge</h2>")?;
    writeln!(
        page,
        "<p>Station reports are accepted on <code>{}</code>.</p>",
        escape(&config.proxy_path)
    )?;
    writeln!(page, "<table>")?;
    let rows = [
        ("MQTT broker", format!("tcp://{}:{}", config.mqtt_host, config.mqtt_port)),
        ("MQTT state", broker_state.to_string()),
        ("Topic prefix", config.entry_point.clone()),
        (
            "Forwarding",
            if config.proxy_enabled {
                config.proxy_url.clone()
            } else {
                "disabled".to_string()
            },
        ),
        ("Requests", stats.hits.load(Ordering::Relaxed).to_string()),
        ("Station reports", stats.reports.load(Ordering::Relaxed).to_string()),
        (
            "Incomplete reports",
            stats.incomplete_reports.load(Ordering::Relaxed).to_string(),
        ),
        ("Broker errors", stats.broker_errors.load(Ordering::Relaxed).to_string()),
        ("Upstream errors", stats.forward_errors.load(Ordering::Relaxed).to_string()),
    ];
    for (label, value) in rows {
        writeln!(page, "<tr><th>{}</th><td>{}</td></tr>", label, escape(&value))?;
    }
    writeln!(page, "</table>")?;
    writeln!(page, "</center></body></html>")?;
    Ok(page)
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_service::testing::{options, MemoryConnector, MemorySession, Sent};
    use crate::topics::{all_topics, INFO_SUFFIX, STATUS_SUFFIX};
    use axum::body::Body;
    use http::Request;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REPORT: &str = "/weatherstation/updateweatherstation.php?ID=KXYZ1&PASSWORD=secret\
        &tempf=51.1&humidity=99&dewptf=50.8&windchillf=51.1&winddir=180\
        &windspeedmph=2.2&windgustmph=3.4&rainin=0.00&dailyrainin=0.12\
        &weeklyrainin=0.50&monthlyrainin=1.20&yearlyrainin=10.40\
        &solarradiation=120.5&UV=1&indoortempf=70.2&indoorhumidity=45\
        &baromin=29.92&lowbatt=0&softwaretype=EasyWeatherV1.4.9\
        &dateutc=now&action=updateraw&realtime=1&rtfreq=5";

    fn state_with(connector: Arc<MemoryConnector>, forwarder: Option<Forwarder>) -> AppState {
        let config = Arc::new(Config::for_tests());
        let broker = BrokerManager::new(connector, options());
        AppState::new(config, broker, forwarder)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String, String) {
        let (status, content_type, body) = get_raw(app, uri).await;
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn get_raw(app: &Router, uri: &str) -> (StatusCode, String, axum::body::Bytes) {
        let response = app
            .clone()
            .oneshot(Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, body)
    }

    fn metric_publishes(sent: &[Sent]) -> Vec<&Sent> {
        let status = format!("/test/meteo/{}", STATUS_SUFFIX);
        let info = format!("/test/meteo/{}", INFO_SUFFIX);
        sent.iter()
            .filter(|s| s.topic != status && s.topic != info)
            .collect()
    }

    #[tokio::test]
    async fn first_report_publishes_every_topic_once() {
        let session = Arc::new(MemorySession::default());
        let app = router(state_with(MemoryConnector::new(session.clone()), None));

        let (status, content_type, body) = get(&app, REPORT).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "success");
        assert!(content_type.starts_with("text/plain"));

        let sent = session.sent();
        assert_eq!(sent[0].topic, "/test/meteo/status");
        assert_eq!(sent[0].payload, "1");
        assert_eq!(sent[1].topic, "/test/meteo/info");

        let metrics = metric_publishes(&sent);
        assert_eq!(metrics.len(), all_topics().count());
        for (sent, spec) in metrics.iter().zip(all_topics()) {
            assert_eq!(sent.topic, format!("/test/meteo/{}", spec.suffix));
            assert_eq!(sent.qos, crate::mqtt_service::QoS::AtMostOnce);
            assert_eq!(sent.retain, spec.retain);
        }

        assert_eq!(session.payload_of("/test/meteo/out/temp").as_deref(), Some("10.6"));
        assert_eq!(session.payload_of("/test/meteo/out/windspeed").as_deref(), Some("3.5"));
        assert_eq!(session.payload_of("/test/meteo/out/humidity").as_deref(), Some("99.0"));
        assert_eq!(session.payload_of("/test/meteo/baro").as_deref(), Some("29.9"));
        assert_eq!(session.payload_of("/test/meteo/weewx/inTemp_C").as_deref(), Some("21.2"));
    }

    #[tokio::test]
    async fn repeated_report_only_refreshes_status_and_info() {
        let session = Arc::new(MemorySession::default());
        let app = router(state_with(MemoryConnector::new(session.clone()), None));

        get(&app, REPORT).await;
        session.take();

        let (status, _, body) = get(&app, REPORT).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "success");

        let sent = session.sent();
        assert!(metric_publishes(&sent).is_empty());
        let topics: Vec<_> = sent.iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(topics, vec!["/test/meteo/status", "/test/meteo/info"]);
    }

    #[tokio::test]
    async fn changed_reading_publishes_only_its_topics() {
        let session = Arc::new(MemorySession::default());
        let app = router(state_with(MemoryConnector::new(session.clone()), None));

        get(&app, REPORT).await;
        session.take();

        get(&app, &REPORT.replace("tempf=51.1", "tempf=52.0")).await;
        let sent = session.sent();
        let metrics = metric_publishes(&sent);
        let topics: Vec<_> = metrics.iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(topics, vec!["/test/meteo/out/temp", "/test/meteo/weewx/outTemp_C"]);
        assert_eq!(metrics[0].payload, "11.1");
    }

    #[tokio::test]
    async fn unreachable_broker_still_answers_the_station() {
        let connector = MemoryConnector::refusing();
        let state = state_with(connector.clone(), None);
        let stats = state.stats.clone();
        let app = router(state);

        let (status, _, body) = tokio::time::timeout(Duration::from_secs(5), get(&app, REPORT))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "success");
        assert_eq!(stats.broker_errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.incomplete_reports.load(Ordering::Relaxed), 0);
        assert!(connector.session.sent().is_empty());

        // the next report retries the connect
        get(&app, REPORT).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_identical_reports_publish_each_metric_once() {
        let session = Arc::new(MemorySession::default());
        let app = router(state_with(MemoryConnector::new(session.clone()), None));

        let (a, b, c) = tokio::join!(get(&app, REPORT), get(&app, REPORT), get(&app, REPORT));
        for (status, _, body) in [a, b, c] {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "success");
        }

        let sent = session.sent();
        let metrics = metric_publishes(&sent);
        assert_eq!(metrics.len(), all_topics().count());
        for spec in all_topics() {
            let topic = format!("/test/meteo/{}", spec.suffix);
            assert_eq!(metrics.iter().filter(|s| s.topic == topic).count(), 1, "{}", topic);
        }
        // liveness and info go out with every report
        assert_eq!(sent.len() - metrics.len(), 6);
    }

    #[tokio::test]
    async fn broker_outage_does_not_stall_queued_reports() {
        let connector = MemoryConnector::refusing();
        let config = Arc::new(Config::for_tests());
        let mut opts = options();
        opts.retry_backoff = Duration::from_secs(30);
        let state = AppState::new(config, BrokerManager::new(connector.clone(), opts), None);
        let stats = state.stats.clone();
        let app = router(state);

        let (a, b, c) = tokio::join!(get(&app, REPORT), get(&app, REPORT), get(&app, REPORT));
        for (status, _, body) in [a, b, c] {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "success");
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(stats.broker_errors.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn forwarding_relays_the_upstream_body() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weatherstation/updateweatherstation.php"))
            .and(query_param("ID", "KXYZ1"))
            .and(query_param("tempf", "51.1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("success\n"))
            .expect(1)
            .mount(&upstream)
            .await;

        let forwarder = Forwarder::new(&upstream.uri(), Duration::from_secs(2)).unwrap();
        let session = Arc::new(MemorySession::default());
        let app = router(state_with(MemoryConnector::new(session.clone()), Some(forwarder)));

        let (status, content_type, body) = get(&app, REPORT).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "success\n");
        assert!(content_type.starts_with("text/plain"));
        assert!(!session.sent().is_empty());
    }

    #[tokio::test]
    async fn forwarded_body_keeps_its_bytes() {
        let upstream = MockServer::start().await;
        let raw: Vec<u8> = vec![b'o', b'k', 0xff, 0xfe, b'\r', b'\n'];
        Mock::given(method("GET"))
            .and(path("/weatherstation/updateweatherstation.php"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(raw.clone()))
            .mount(&upstream)
            .await;

        let forwarder = Forwarder::new(&upstream.uri(), Duration::from_secs(2)).unwrap();
        let session = Arc::new(MemorySession::default());
        let app = router(state_with(MemoryConnector::new(session), Some(forwarder)));

        let (status, _, body) = get_raw(&app, REPORT).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.to_vec(), raw);
    }

    #[tokio::test]
    async fn upstream_failure_is_a_bad_gateway() {
        let forwarder = Forwarder::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let state = state_with(MemoryConnector::new(Arc::new(MemorySession::default())), Some(forwarder));
        let stats = state.stats.clone();
        let app = router(state);

        let (status, _, _) = get(&app, REPORT).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(stats.forward_errors.load(Ordering::Relaxed), 1);

        // the bridge keeps serving afterwards
        let (status, _, _) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn other_requests_get_the_info_page() {
        let session = Arc::new(MemorySession::default());
        let app = router(state_with(MemoryConnector::new(session.clone()), None));

        let (status, content_type, body) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/html"));
        assert!(body.contains("observer-bridge"));
        assert!(body.contains("disconnected"));
        assert!(session.sent().is_empty());

        let (status, _, _) = get(&app, "/favicon.ico").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn telemetry_requires_get() {
        let session = Arc::new(MemorySession::default());
        let app = router(state_with(MemoryConnector::new(session.clone()), None));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/weatherstation/updateweatherstation.php")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(session.sent().is_empty());
    }

    #[test]
    fn info_page_escapes_configuration() {
        let mut config = Config::for_tests();
        config.proxy_path = "/<script>".to_string();
        let page = render_info_page(&config, &ServerStats::default(), &ClientState::Connected).unwrap();
        assert!(page.contains("/&lt;script&gt;"));
        assert!(page.contains("connected"));
    }
}

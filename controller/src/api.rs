//! Control API Server

use crate::model::{Channel, SwitchDescriptor};
use crate::registry::SwitchRegistry;
use crate::sla::SlaRouter;
use crate::stats::{StatsCollector, SwitchStats};
use crate::store::{ActivationFailure, ChannelStore};
use crate::switch::format_dpid;
use crate::{Result, SteerError};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handles for request handlers
#[derive(Clone)]
pub struct ApiState {
    /// Attached switches
    pub registry: Arc<SwitchRegistry>,
    /// Policy
    pub store: Arc<ChannelStore>,
    /// Counters
    pub stats: Arc<StatsCollector>,
    /// Key forwarding
    pub sla: Arc<SlaRouter>,
}

impl IntoResponse for SteerError {
    fn into_response(self) -> Response {
        let status = match self {
            SteerError::PersistenceFailure(_) | SteerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Build the control router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/channels", get(channels))
        .route("/statistics", get(statistics))
        .route("/statistics/switches", get(switch_statistics))
        .route("/switches", get(switches))
        .route("/activate", get(activate))
        .route("/channel", post(set_channels))
        .route("/channel/:channel/:sla", get(switch_channel))
        .route("/ovs", post(set_ovs))
        .route("/qkey/:ovs/:sla", post(qkey))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `signal` resolves
pub async fn serve<F>(addr: SocketAddr, state: ApiState, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control API listening on {}", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await?;
    Ok(())
}

async fn status() -> &'static str {
    "1"
}

async fn channels(State(state): State<ApiState>) -> String {
    state.store.channel_count().to_string()
}

async fn statistics(State(state): State<ApiState>) -> String {
    state.stats.total_packets().to_string()
}

async fn switch_statistics(State(state): State<ApiState>) -> Json<Vec<SwitchStats>> {
    Json(state.stats.snapshot())
}

async fn switches(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.registry.dpids().into_iter().map(format_dpid).collect())
}

#[derive(Serialize)]
struct ActivateResponse {
    result: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failed: Vec<ActivationFailure>,
}

async fn activate(State(state): State<ApiState>) -> Json<ActivateResponse> {
    let report = state.store.activate_all().await;
    Json(ActivateResponse {
        result: "Rules are activated.",
        failed: report.failed,
    })
}

#[derive(Serialize)]
struct ChannelResult {
    id: String,
    result: String,
}

async fn set_channels(State(state): State<ApiState>, body: Bytes) -> Result<Json<Vec<ChannelResult>>> {
    let batch: BTreeMap<String, Channel> = parse_body(&body)?;
    let applied = state.store.upsert_channels(batch).await?;
    Ok(Json(
        applied
            .into_iter()
            .map(|id| ChannelResult {
                id,
                result: "Configurations are added.".into(),
            })
            .collect(),
    ))
}

#[derive(Serialize)]
struct OvsResult {
    result: &'static str,
}

async fn set_ovs(State(state): State<ApiState>, body: Bytes) -> Result<Json<OvsResult>> {
    let partial: BTreeMap<String, SwitchDescriptor> = parse_body(&body)?;
    state.store.update_switches(partial).await?;
    Ok(Json(OvsResult { result: "OVS updated." }))
}

async fn switch_channel(
    State(state): State<ApiState>,
    Path((channel, sla)): Path<(String, String)>,
) -> Result<Response> {
    // Both segments are single decimal digits; anything else is not a route
    if !is_digit(&channel) || !is_digit(&sla) {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    state.store.set_channel_sla(&channel, &sla).await?;
    Ok(Json(ChannelResult {
        id: channel,
        result: format!("Switched to channel: {}", sla),
    })
    .into_response())
}

async fn qkey(
    State(state): State<ApiState>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
    Path((ovs, sla)): Path<(String, String)>,
    body: Bytes,
) -> Result<String> {
    let report = state.sla.route(&ovs, &sla, body, caller.ip()).await?;
    Ok(report.render())
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| SteerError::MalformedRequest(e.to_string()))
}

fn is_digit(segment: &str) -> bool {
    segment.len() == 1 && segment.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PolicyDocument;
    use crate::store::MemoryBackend;
    use crate::switch::MemorySwitch;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    const POLICY: &str = r#"{
        "ovs": {
            "1": {
                "dpid": "0000000000000001",
                "intport": {"1": {"type": "server"}},
                "outport": {"2": {"sla": "1", "mzvs": "1"}, "3": {"sla": "2", "mzvs": "2"}},
                "mzvs": {"1": [], "2": []}
            },
            "2": {
                "dpid": "0000000000000002",
                "intport": {"1": {"type": "client"}},
                "outport": {"2": {"sla": "1", "mzvs": "1"}, "3": {"sla": "2", "mzvs": "2"}}
            }
        }
    }"#;

    struct Harness {
        server: TestServer,
        state: ApiState,
        backend: Arc<MemoryBackend>,
        s1: Arc<MemorySwitch>,
    }

    async fn state() -> (ApiState, Arc<MemoryBackend>, Arc<MemorySwitch>) {
        let registry = Arc::new(SwitchRegistry::new());
        let s1 = Arc::new(MemorySwitch::new(1));
        registry.on_attach(s1.clone());
        registry.on_attach(Arc::new(MemorySwitch::new(2)));

        let backend = Arc::new(MemoryBackend::new(PolicyDocument::from_json(POLICY).unwrap()));
        let store = Arc::new(
            ChannelStore::open(registry.clone(), backend.clone(), Duration::from_secs(1)).await,
        );
        let sla = Arc::new(SlaRouter::new(store.clone(), Duration::from_secs(1)).unwrap());
        let stats = Arc::new(StatsCollector::new(Duration::from_secs(1)));
        (ApiState { registry, store, stats, sla }, backend, s1)
    }

    fn app(state: ApiState) -> Router {
        router(state).layer(MockConnectInfo(SocketAddr::from(([192, 0, 2, 7], 40000))))
    }

    async fn harness() -> Harness {
        let (state, backend, s1) = state().await;
        let server = TestServer::new(app(state.clone())).unwrap();
        Harness { server, state, backend, s1 }
    }

    fn channel(id: &str, sla: &str, active: &str) -> Value {
        json!({
            id: {
                "src": {"ovs": "1", "subnet": "10.0.1.0/24", "vlan": 10, "type": "server"},
                "dst": {"ovs": 2, "subnet": "10.0.2.0/24", "vlan": 20, "type": "client"},
                "sla": sla,
                "active": active
            }
        })
    }

    #[tokio::test]
    async fn test_status() {
        let h = harness().await;
        let response = h.server.get("/status").await;
        response.assert_status_ok();
        assert_eq!(response.text(), "1");
    }

    #[tokio::test]
    async fn test_post_channel_counts_and_replaces() {
        let h = harness().await;

        let response = h.server.post("/channel").json(&channel("1", "1", "1")).await;
        response.assert_status_ok();
        assert_eq!(
            response.json::<Value>(),
            json!([{"id": "1", "result": "Configurations are added."}])
        );
        h.server.post("/channel").json(&channel("2", "2", "0")).await.assert_status_ok();
        assert_eq!(h.server.get("/channels").await.text(), "2");

        h.server.post("/channel").json(&channel("1", "2", "1")).await.assert_status_ok();
        assert_eq!(h.server.get("/channels").await.text(), "2");
        assert_eq!(h.s1.rule_count(), 4);
        assert_eq!(h.backend.saved().channels["1"].sla.to_string(), "2");
    }

    #[tokio::test]
    async fn test_malformed_channel_body() {
        let h = harness().await;
        let response = h.server.post("/channel").text("{\"1\": {\"src\": 5}}").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert!(response.text().starts_with("malformed request"));
        assert_eq!(h.server.get("/channels").await.text(), "0");
    }

    #[tokio::test]
    async fn test_switch_channel() {
        let h = harness().await;
        h.server.post("/channel").json(&channel("1", "1", "1")).await.assert_status_ok();

        let response = h.server.get("/channel/1/0").await;
        response.assert_status_ok();
        assert_eq!(
            response.json::<Value>(),
            json!({"id": "1", "result": "Switched to channel: 0"})
        );
        assert_eq!(h.s1.rule_count(), 0);

        h.server.get("/channel/1/2").await.assert_status_ok();
        assert_eq!(h.s1.rule_count(), 4);
    }

    #[tokio::test]
    async fn test_switch_unknown_channel() {
        let h = harness().await;
        let before = h.state.store.snapshot();

        let response = h.server.get("/channel/7/1").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.text(), "channel doesn't exists");
        assert_eq!(h.state.store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_switch_channel_requires_single_digits() {
        let (state, _, _) = state().await;
        let response = app(state)
            .oneshot(Request::builder().uri("/channel/12/1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_activate() {
        let h = harness().await;
        h.server.post("/channel").json(&channel("1", "1", "1")).await.assert_status_ok();

        for _ in 0..2 {
            let response = h.server.get("/activate").await;
            response.assert_status_ok();
            assert_eq!(response.json::<Value>(), json!({"result": "Rules are activated."}));
        }
        assert_eq!(h.s1.rule_count(), 4);
    }

    #[tokio::test]
    async fn test_activate_reports_failures() {
        let h = harness().await;
        h.server.post("/channel").json(&channel("1", "1", "0")).await.assert_status_ok();
        h.state.registry.on_detach(2);
        h.server.get("/channel/1/1").await.assert_status(StatusCode::BAD_REQUEST);

        let body = h.server.get("/activate").await.json::<Value>();
        assert_eq!(body["result"], "Rules are activated.");
        assert_eq!(body["failed"][0]["id"], "1");
    }

    #[tokio::test]
    async fn test_post_ovs() {
        let h = harness().await;
        let response = h
            .server
            .post("/ovs")
            .json(&json!({"3": {"dpid": "0000000000000003", "intport": {"1": {"type": "server"}}}}))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>(), json!({"result": "OVS updated."}));
        assert!(h.backend.saved().ovs.contains_key("3"));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_server_error() {
        let h = harness().await;
        h.backend.fail_saves(true);
        let response = h.server.post("/ovs").json(&json!({})).await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_qkey_transcript() {
        let h = harness().await;

        let response = h.server.post("/qkey/1/1").text("abc").await;
        response.assert_status_ok();
        assert_eq!(response.text(), "ADDR: 192.0.2.7 QKEY: abc\n");

        let response = h.server.post("/qkey/1/5").text("abc").await;
        assert_eq!(response.text(), "Cannot find sla_id: 5\n");

        h.server.post("/qkey/9/1").text("abc").await.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_statistics_and_switches() {
        let h = harness().await;
        h.server.post("/channel").json(&channel("1", "1", "1")).await.assert_status_ok();
        h.s1.count_packets(2);
        h.state.stats.poll_once(&h.state.registry).await;

        assert_eq!(h.server.get("/statistics").await.text(), "8");
        let per_switch = h.server.get("/statistics/switches").await.json::<Value>();
        assert_eq!(per_switch[0]["dpid"], "0000000000000001");
        assert_eq!(per_switch[0]["packets"], 8);
        assert_eq!(
            h.server.get("/switches").await.json::<Value>(),
            json!(["0000000000000001", "0000000000000002"])
        );
    }
}

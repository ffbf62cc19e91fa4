//! HTTP API.
//!
//! JSON routes under `/v1` over the pool managers, plus `/metrics` and
//! `/healthz`. Errors render through [`ControllerError`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use netpool::{Netpool, Pool, subnet};
use pool_store::{
    FixedIp, FloatingIp, MemoryPoolStore, Network, NetworkId, Volume, VolumeId, VolumeStatus,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::ControllerError;
use crate::metrics::Metrics;

type ApiResult<T> = Result<T, ControllerError>;

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    pool: Netpool<MemoryPoolStore>,
    node_name: Arc<str>,
    metrics: Metrics,
}

impl AppState {
    pub fn new(pool: Netpool<MemoryPoolStore>, node_name: String, metrics: Metrics) -> Self {
        Self {
            pool,
            node_name: node_name.into(),
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/networks", post(create_network))
        .route("/v1/networks/{id}", get(get_network).delete(destroy_network))
        .route("/v1/networks/{id}/host", put(set_host).get(get_host))
        .route("/v1/networks/{id}/fixed-ips", post(allocate_fixed_ip))
        .route("/v1/networks/{id}/vpn", post(reserve_vpn_ip))
        .route("/v1/projects/{project_id}/network", get(project_network))
        .route("/v1/fixed-ips/{address}", get(get_fixed_ip))
        .route("/v1/fixed-ips/{address}/lease", post(lease_fixed_ip))
        .route("/v1/fixed-ips/{address}/release", post(release_fixed_ip))
        .route("/v1/fixed-ips/{address}/deallocate", post(deallocate_fixed_ip))
        .route(
            "/v1/fixed-ips/{address}/instance",
            put(associate_instance).delete(disassociate_instance),
        )
        .route("/v1/floating-ips", post(allocate_floating_ip))
        .route(
            "/v1/floating-ips/{address}",
            get(get_floating_ip).delete(deallocate_floating_ip),
        )
        .route(
            "/v1/floating-ips/{address}/association",
            put(associate_floating_ip).delete(disassociate_floating_ip),
        )
        .route("/v1/volumes", post(create_volume))
        .route("/v1/volumes/{id}", get(get_volume).delete(destroy_volume))
        .route("/v1/volumes/{id}/export", post(allocate_export).get(get_export))
        .route(
            "/v1/volumes/{id}/attachment",
            put(attach_volume).delete(detach_volume),
        )
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ProjectRequest {
    project_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct HostBody {
    host: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddressResponse {
    address: std::net::Ipv4Addr,
}

#[derive(Debug, Deserialize)]
struct InstanceRequest {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
struct AssociationRequest {
    fixed_address: String,
}

#[derive(Debug, Serialize)]
struct AssociationResponse {
    fixed_address: std::net::Ipv4Addr,
}

#[derive(Debug, Deserialize)]
struct CreateVolumeRequest {
    #[serde(default)]
    project_id: Option<String>,
    size_gb: u32,
}

#[derive(Debug, Deserialize)]
struct AttachRequest {
    instance_id: String,
    mountpoint: String,
}

#[derive(Debug, Serialize)]
struct ExportResponse {
    shelf_id: u16,
    blade_id: u16,
}

/// Volume with its derived status
#[derive(Debug, Serialize)]
struct VolumeView {
    #[serde(flatten)]
    volume: Volume,
    status: VolumeStatus,
}

impl From<Volume> for VolumeView {
    fn from(volume: Volume) -> Self {
        Self {
            status: volume.status(),
            volume,
        }
    }
}

// Networks

async fn create_network(
    State(state): State<AppState>,
    Json(request): Json<ProjectRequest>,
) -> ApiResult<impl IntoResponse> {
    let result = state.pool.networks.provision(&request.project_id).await;
    state.metrics.observe(Pool::NetworkIndexes, &result);
    Ok((StatusCode::CREATED, Json(result?)))
}

async fn get_network(
    State(state): State<AppState>,
    Path(id): Path<NetworkId>,
) -> ApiResult<Json<Network>> {
    Ok(Json(state.pool.networks.get(id).await?))
}

async fn destroy_network(
    State(state): State<AppState>,
    Path(id): Path<NetworkId>,
) -> ApiResult<StatusCode> {
    state.pool.networks.destroy(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_host(
    State(state): State<AppState>,
    Path(id): Path<NetworkId>,
    Json(request): Json<HostBody>,
) -> ApiResult<Json<HostBody>> {
    let requested = request.host.unwrap_or_else(|| state.node_name.to_string());
    let host = state.pool.networks.set_host(id, &requested).await?;
    Ok(Json(HostBody { host: Some(host) }))
}

async fn get_host(
    State(state): State<AppState>,
    Path(id): Path<NetworkId>,
) -> ApiResult<Json<HostBody>> {
    let host = state.pool.networks.get_host(id).await?;
    Ok(Json(HostBody { host }))
}

async fn reserve_vpn_ip(
    State(state): State<AppState>,
    Path(id): Path<NetworkId>,
) -> ApiResult<Json<AddressResponse>> {
    let address = state.pool.networks.reserve_vpn_ip(id).await?;
    Ok(Json(AddressResponse { address }))
}

async fn project_network(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Network>> {
    Ok(Json(state.pool.networks.project_network(&project_id).await?))
}

// Fixed IPs

async fn allocate_fixed_ip(
    State(state): State<AppState>,
    Path(id): Path<NetworkId>,
) -> ApiResult<Json<AddressResponse>> {
    let result = state.pool.fixed_ips.allocate(id).await;
    state.metrics.observe(Pool::FixedIps, &result);
    Ok(Json(AddressResponse { address: result? }))
}

async fn get_fixed_ip(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<FixedIp>> {
    let address = subnet::parse_address(&address)?;
    Ok(Json(state.pool.fixed_ips.get_by_address(address).await?))
}

async fn lease_fixed_ip(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<FixedIp>> {
    let address = subnet::parse_address(&address)?;
    Ok(Json(state.pool.fixed_ips.lease(address).await?))
}

async fn release_fixed_ip(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<FixedIp>> {
    let address = subnet::parse_address(&address)?;
    Ok(Json(state.pool.fixed_ips.release(address).await?))
}

async fn deallocate_fixed_ip(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<FixedIp>> {
    let address = subnet::parse_address(&address)?;
    Ok(Json(state.pool.fixed_ips.deallocate(address).await?))
}

async fn associate_instance(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(request): Json<InstanceRequest>,
) -> ApiResult<Json<FixedIp>> {
    let address = subnet::parse_address(&address)?;
    Ok(Json(
        state
            .pool
            .fixed_ips
            .associate_instance(address, &request.instance_id)
            .await?,
    ))
}

async fn disassociate_instance(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<FixedIp>> {
    let address = subnet::parse_address(&address)?;
    Ok(Json(state.pool.fixed_ips.disassociate_instance(address).await?))
}

// Floating IPs

async fn allocate_floating_ip(
    State(state): State<AppState>,
    Json(request): Json<ProjectRequest>,
) -> ApiResult<Json<AddressResponse>> {
    let result = state
        .pool
        .floating_ips
        .allocate(&state.node_name, &request.project_id)
        .await;
    state.metrics.observe(Pool::FloatingIps, &result);
    Ok(Json(AddressResponse { address: result? }))
}

async fn get_floating_ip(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<FloatingIp>> {
    let address = subnet::parse_address(&address)?;
    Ok(Json(state.pool.floating_ips.get_by_address(address).await?))
}

async fn deallocate_floating_ip(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<StatusCode> {
    let address = subnet::parse_address(&address)?;
    state.pool.floating_ips.deallocate(address).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn associate_floating_ip(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(request): Json<AssociationRequest>,
) -> ApiResult<StatusCode> {
    let floating = subnet::parse_address(&address)?;
    let fixed = subnet::parse_address(&request.fixed_address)?;
    state.pool.floating_ips.associate(floating, fixed).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disassociate_floating_ip(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<AssociationResponse>> {
    let address = subnet::parse_address(&address)?;
    let fixed_address = state.pool.floating_ips.disassociate(address).await?;
    Ok(Json(AssociationResponse { fixed_address }))
}

// Volumes

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> ApiResult<impl IntoResponse> {
    let volume = state
        .pool
        .volumes
        .create(request.project_id, request.size_gb)
        .await?;
    Ok((StatusCode::CREATED, Json(VolumeView::from(volume))))
}

async fn get_volume(
    State(state): State<AppState>,
    Path(id): Path<VolumeId>,
) -> ApiResult<Json<VolumeView>> {
    Ok(Json(state.pool.volumes.get(id).await?.into()))
}

async fn destroy_volume(
    State(state): State<AppState>,
    Path(id): Path<VolumeId>,
) -> ApiResult<StatusCode> {
    state.pool.volumes.destroy(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn allocate_export(
    State(state): State<AppState>,
    Path(id): Path<VolumeId>,
) -> ApiResult<Json<ExportResponse>> {
    let result = state.pool.volumes.allocate_shelf_and_blade(id).await;
    state.metrics.observe(Pool::ExportDevices, &result);
    let (shelf_id, blade_id) = result?;
    Ok(Json(ExportResponse { shelf_id, blade_id }))
}

async fn get_export(
    State(state): State<AppState>,
    Path(id): Path<VolumeId>,
) -> ApiResult<Json<ExportResponse>> {
    let (shelf_id, blade_id) = state.pool.volumes.shelf_and_blade(id).await?;
    Ok(Json(ExportResponse { shelf_id, blade_id }))
}

async fn attach_volume(
    State(state): State<AppState>,
    Path(id): Path<VolumeId>,
    Json(request): Json<AttachRequest>,
) -> ApiResult<Json<VolumeView>> {
    let volume = state
        .pool
        .volumes
        .attach(id, &request.instance_id, &request.mountpoint)
        .await?;
    Ok(Json(volume.into()))
}

async fn detach_volume(
    State(state): State<AppState>,
    Path(id): Path<VolumeId>,
) -> ApiResult<Json<VolumeView>> {
    Ok(Json(state.pool.volumes.detach(id).await?.into()))
}

// Probes

async fn metrics_endpoint(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let body = state.metrics.encode()?;
    debug!(bytes = body.len(), "Serving metrics");
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use netpool::NetworkConfig;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn app(num_networks: u32) -> (Router, AppState) {
        let config = NetworkConfig {
            num_networks,
            network_size: 16,
            cnt_vpn_clients: 2,
            ..Default::default()
        };
        let pool = Netpool::new(MemoryPoolStore::new(), config);
        pool.floating_ips
            .create_range("node-1", "198.51.100.0/31".parse().unwrap())
            .await
            .unwrap();
        pool.volumes.add_export_devices(1, 1).await.unwrap();

        let state = AppState::new(pool, "node-1".to_string(), Metrics::new().unwrap());
        (router(state.clone()), state)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(serde_json::to_vec(&body).unwrap())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_healthz() {
        let (app, _) = app(1).await;
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_provision_and_exhaustion() {
        let (app, _) = app(1).await;

        let (status, network) = send(
            &app,
            Method::POST,
            "/v1/networks",
            Some(json!({"project_id": "proj-a"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(network["cidr"], "10.0.0.0/28");
        assert_eq!(network["bridge"], "br100");

        let (status, fetched) = send(&app, Method::GET, "/v1/projects/proj-a/network", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], network["id"]);

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/networks",
            Some(json!({"project_id": "proj-b"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "No more networks available");
    }

    #[tokio::test]
    async fn test_unknown_network_is_404() {
        let (app, _) = app(1).await;
        let (status, body) = send(&app, Method::GET, "/v1/networks/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("network 42"));
    }

    #[tokio::test]
    async fn test_host_assignment_first_wins() {
        let (app, state) = app(1).await;
        let network = state.pool.networks.create("proj-a").await.unwrap();
        let uri = format!("/v1/networks/{}/host", network.id);

        let (status, body) = send(&app, Method::PUT, &uri, Some(json!({"host": "node-7"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["host"], "node-7");

        let (_, body) = send(&app, Method::PUT, &uri, Some(json!({"host": "node-8"}))).await;
        assert_eq!(body["host"], "node-7");
    }

    #[tokio::test]
    async fn test_fixed_ip_lifecycle() {
        let (app, state) = app(1).await;
        let network = state.pool.networks.provision("proj-a").await.unwrap();

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/v1/networks/{}/fixed-ips", network.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["address"], "10.0.0.3");

        let (status, body) = send(&app, Method::POST, "/v1/fixed-ips/10.0.0.4/lease", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Address not allocated: 10.0.0.4");

        let (status, body) = send(&app, Method::POST, "/v1/fixed-ips/10.0.0.3/lease", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["leased"], true);

        let (_, body) = send(
            &app,
            Method::PUT,
            "/v1/fixed-ips/10.0.0.3/instance",
            Some(json!({"instance_id": "i-1"})),
        )
        .await;
        assert_eq!(body["instance_id"], "i-1");

        let (status, body) = send(&app, Method::POST, "/v1/fixed-ips/10.0.0.3/release", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allocated"], false);
        assert_eq!(body["leased"], false);
    }

    #[tokio::test]
    async fn test_invalid_address_is_400() {
        let (app, _) = app(1).await;
        let (status, body) = send(&app, Method::POST, "/v1/fixed-ips/not-an-ip/lease", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid address: not-an-ip");
    }

    #[tokio::test]
    async fn test_floating_ip_flow() {
        let (app, state) = app(1).await;
        let network = state.pool.networks.provision("proj-a").await.unwrap();
        let fixed = state.pool.fixed_ips.allocate(network.id).await.unwrap();

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/floating-ips",
            Some(json!({"project_id": "proj-a"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let floating = body["address"].as_str().unwrap().to_string();
        let association = format!("/v1/floating-ips/{}/association", floating);

        let (status, _) = send(
            &app,
            Method::PUT,
            &association,
            Some(json!({"fixed_address": fixed.to_string()})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, Method::DELETE, &association, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fixed_address"], fixed.to_string());

        let (status, _) = send(&app, Method::DELETE, &association, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!("/v1/floating-ips/{}", floating),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_volume_export_and_attachment() {
        let (app, _) = app(1).await;

        let (status, volume) = send(&app, Method::POST, "/v1/volumes", Some(json!({"size_gb": 10}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(volume["status"], "available");
        let id = volume["id"].as_u64().unwrap();

        let (status, body) = send(&app, Method::POST, &format!("/v1/volumes/{id}/export"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"shelf_id": 0, "blade_id": 0}));

        let (_, other) = send(&app, Method::POST, "/v1/volumes", Some(json!({"size_gb": 1}))).await;
        let other_id = other["id"].as_u64().unwrap();
        let (status, _) = send(&app, Method::POST, &format!("/v1/volumes/{other_id}/export"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &app,
            Method::PUT,
            &format!("/v1/volumes/{id}/attachment"),
            Some(json!({"instance_id": "i-1", "mountpoint": "/dev/vdb"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "in-use");
        assert_eq!(body["attachment"]["attach_status"], "attached");
        assert_eq!(body["attachment"]["mountpoint"], "/dev/vdb");

        let (_, body) = send(&app, Method::DELETE, &format!("/v1/volumes/{id}/attachment"), None).await;
        assert_eq!(body["status"], "available");
        assert_eq!(body["attachment"]["attach_status"], "detached");
    }

    #[tokio::test]
    async fn test_metrics_count_claims() {
        let (app, _) = app(1).await;
        send(&app, Method::POST, "/v1/floating-ips", Some(json!({"project_id": "p"}))).await;
        send(&app, Method::POST, "/v1/floating-ips", Some(json!({"project_id": "q"}))).await;
        send(&app, Method::POST, "/v1/floating-ips", Some(json!({"project_id": "r"}))).await;

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("netpool_claims_total{pool=\"floating_ips\"} 2"));
        assert!(text.contains("netpool_exhausted_total{pool=\"floating_ips\"} 1"));
    }
}

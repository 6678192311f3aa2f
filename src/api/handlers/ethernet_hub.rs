use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::super::ApiServer;
use crate::dynamips::capture::LinkType;
use crate::dynamips::hub::PortSpec;
use crate::dynamips::nio::NioConfig;
use crate::dynamips::{NodeCreate, NodeType};
use crate::error::ControlError;

pub const PCAP_CONTENT_TYPE: &str = "application/vnd.tcpdump.pcap";

#[derive(Debug, Deserialize)]
pub struct EthernetHubCreate {
    pub name: String,
    #[serde(default)]
    pub node_id: Option<Uuid>,
    #[serde(default)]
    pub ports_mapping: Option<Vec<PortSpec>>,
}

#[derive(Debug, Deserialize)]
pub struct EthernetHubUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ports_mapping: Option<Vec<PortSpec>>,
}

#[derive(Debug, Deserialize)]
pub struct DuplicateRequest {
    pub destination_node_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct NodeCapture {
    pub capture_file_name: String,
    #[serde(default = "default_link_type")]
    pub data_link_type: String,
}

fn default_link_type() -> String {
    LinkType::default().to_string()
}

type NodePath = Path<(Uuid, Uuid)>;
type PortPath = Path<(Uuid, Uuid, u32, u32)>;

/// Hubs have a single adapter; the number is accepted but not checked.
fn note_adapter(node_id: Uuid, adapter_number: u32) {
    if adapter_number != 0 {
        tracing::debug!(
            "Ignoring adapter number {} for ethernet hub {}",
            adapter_number,
            node_id
        );
    }
}

/// POST /v3/compute/projects/:project_id/ethernet_hub/nodes
pub async fn create_ethernet_hub(
    State(state): State<ApiServer>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<EthernetHubCreate>,
) -> Result<impl IntoResponse, ControlError> {
    let node = state
        .dynamips
        .create_node(NodeCreate {
            name: body.name,
            project_id,
            node_id: body.node_id,
            node_type: NodeType::EthernetHub,
            ports: body.ports_mapping,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(node.info()?)))
}

/// GET .../nodes/:node_id
pub async fn get_ethernet_hub(
    State(state): State<ApiServer>,
    Path((project_id, node_id)): NodePath,
) -> Result<impl IntoResponse, ControlError> {
    let node = state.dynamips.get_node(node_id, project_id)?;
    Ok(Json(node.info()?))
}

/// PUT .../nodes/:node_id
pub async fn update_ethernet_hub(
    State(state): State<ApiServer>,
    Path((project_id, node_id)): NodePath,
    Json(body): Json<EthernetHubUpdate>,
) -> Result<impl IntoResponse, ControlError> {
    let node = state.dynamips.get_node(node_id, project_id)?;
    if let Some(ports) = body.ports_mapping {
        node.set_ports_mapping(ports)?;
    }
    if let Some(name) = body.name.as_deref() {
        node.set_name(name)?;
    }
    node.updated();
    Ok(Json(node.info()?))
}

/// DELETE .../nodes/:node_id
pub async fn delete_ethernet_hub(
    State(state): State<ApiServer>,
    Path((project_id, node_id)): NodePath,
) -> Result<impl IntoResponse, ControlError> {
    state.dynamips.get_node(node_id, project_id)?;
    state.dynamips.delete_node(node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST .../nodes/:node_id/duplicate
pub async fn duplicate_ethernet_hub(
    State(state): State<ApiServer>,
    Path((project_id, node_id)): NodePath,
    Json(body): Json<DuplicateRequest>,
) -> Result<impl IntoResponse, ControlError> {
    state.dynamips.get_node(node_id, project_id)?;
    let node = state
        .dynamips
        .duplicate_node(node_id, body.destination_node_id)
        .await?;
    Ok((StatusCode::CREATED, Json(node.info()?)))
}

// A hub is always running: start, stop and suspend only check the node.

/// POST .../nodes/:node_id/start
pub async fn start_ethernet_hub(
    State(state): State<ApiServer>,
    Path((project_id, node_id)): NodePath,
) -> Result<impl IntoResponse, ControlError> {
    state.dynamips.get_node(node_id, project_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST .../nodes/:node_id/stop
pub async fn stop_ethernet_hub(
    State(state): State<ApiServer>,
    Path((project_id, node_id)): NodePath,
) -> Result<impl IntoResponse, ControlError> {
    state.dynamips.get_node(node_id, project_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST .../nodes/:node_id/suspend
pub async fn suspend_ethernet_hub(
    State(state): State<ApiServer>,
    Path((project_id, node_id)): NodePath,
) -> Result<impl IntoResponse, ControlError> {
    state.dynamips.get_node(node_id, project_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST .../adapters/:adapter_number/ports/:port_number/nio
pub async fn create_nio(
    State(state): State<ApiServer>,
    Path((project_id, node_id, adapter_number, port_number)): PortPath,
    Json(config): Json<NioConfig>,
) -> Result<impl IntoResponse, ControlError> {
    let node = state.dynamips.get_node(node_id, project_id)?;
    note_adapter(node_id, adapter_number);
    let nio = state.dynamips.attach_nio(&node, port_number, config).await?;
    tracing::info!("NIO {} added to hub {} port {}", nio.name(), node_id, port_number);
    Ok((StatusCode::CREATED, Json(nio.config().clone())))
}

/// DELETE .../adapters/:adapter_number/ports/:port_number/nio
pub async fn delete_nio(
    State(state): State<ApiServer>,
    Path((project_id, node_id, adapter_number, port_number)): PortPath,
) -> Result<impl IntoResponse, ControlError> {
    let node = state.dynamips.get_node(node_id, project_id)?;
    note_adapter(node_id, adapter_number);
    state.dynamips.detach_nio(&node, port_number).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST .../adapters/:adapter_number/ports/:port_number/start_capture
pub async fn start_capture(
    State(state): State<ApiServer>,
    Path((project_id, node_id, adapter_number, port_number)): PortPath,
    Json(body): Json<NodeCapture>,
) -> Result<impl IntoResponse, ControlError> {
    let node = state.dynamips.get_node(node_id, project_id)?;
    note_adapter(node_id, adapter_number);
    let link_type: LinkType = body.data_link_type.parse()?;
    let path = state
        .dynamips
        .start_capture(&node, port_number, &body.capture_file_name, link_type)
        .await?;
    Ok(Json(json!({ "pcap_file_path": path.to_string_lossy() })))
}

/// POST .../adapters/:adapter_number/ports/:port_number/stop_capture
pub async fn stop_capture(
    State(state): State<ApiServer>,
    Path((project_id, node_id, adapter_number, port_number)): PortPath,
) -> Result<impl IntoResponse, ControlError> {
    let node = state.dynamips.get_node(node_id, project_id)?;
    note_adapter(node_id, adapter_number);
    state.dynamips.stop_capture(&node, port_number).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET .../adapters/:adapter_number/ports/:port_number/pcap
///
/// Streams the capture file while it grows. The body ends when the capture
/// stops, the NIO is detached or the server shuts down.
pub async fn stream_pcap_file(
    State(state): State<ApiServer>,
    Path((project_id, node_id, adapter_number, port_number)): PortPath,
) -> Result<impl IntoResponse, ControlError> {
    let node = state.dynamips.get_node(node_id, project_id)?;
    note_adapter(node_id, adapter_number);
    let nio = node.get_nio(port_number).await?;
    let stream = state
        .dynamips
        .stream_pcap_file(&nio, state.scheduler.clone())
        .await?;
    Ok((
        [(header::CONTENT_TYPE, PCAP_CONTENT_TYPE)],
        Body::from_stream(stream),
    ))
}

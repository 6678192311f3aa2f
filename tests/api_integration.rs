/// HTTP surface tests, driven through the router without a socket.
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use netemu_core::api::ApiServer;
use netemu_core::dynamips::Dynamips;
use netemu_core::port_manager::PortManager;
use netemu_core::project::ProjectPaths;
use netemu_core::supervisor::coordinator::BackendModule;

struct TestApi {
    _tmp: tempfile::TempDir,
    dynamips: Arc<Dynamips>,
    scheduler: CancellationToken,
    router: Router,
    project: Uuid,
}

fn setup() -> TestApi {
    let tmp = tempfile::tempdir().unwrap();
    let dynamips = Arc::new(Dynamips::new(ProjectPaths::new(tmp.path())));
    dynamips.attach_port_manager(Arc::new(PortManager::with_udp_range("127.0.0.1", 30000, 30100)));
    let scheduler = CancellationToken::new();
    let router = ApiServer::new(dynamips.clone(), scheduler.clone()).router();
    TestApi {
        _tmp: tmp,
        dynamips,
        scheduler,
        router,
        project: Uuid::new_v4(),
    }
}

impl TestApi {
    fn nodes(&self) -> String {
        format!("/v3/compute/projects/{}/ethernet_hub/nodes", self.project)
    }

    fn port(&self, node: &str, adapter: u32, port: u32) -> String {
        format!("{}/{}/adapters/{}/ports/{}", self.nodes(), node, adapter, port)
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn create_hub(&self, name: &str) -> String {
        let (status, body) = self
            .send(Method::POST, &self.nodes(), Some(json!({ "name": name })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["node_id"].as_str().unwrap().to_string()
    }

    async fn attach_udp(&self, node: &str, port: u32, lport: u16) -> StatusCode {
        let nio = json!({ "type": "nio_udp", "lport": lport, "rhost": "127.0.0.1", "rport": lport + 1 });
        self.send(Method::POST, &format!("{}/nio", self.port(node, 0, port)), Some(nio))
            .await
            .0
    }

    async fn pcap(&self, node: &str, port: u32) -> axum::response::Response {
        let request = Request::builder()
            .uri(format!("{}/pcap", self.port(node, 0, port)))
            .body(Body::empty())
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }
}

#[tokio::test]
async fn test_version() {
    let api = setup();
    let (status, body) = api.send(Method::GET, "/v3/compute/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_hub_create_get_update_delete() {
    let api = setup();
    let node = api.create_hub("Hub1").await;

    let (status, body) = api.send(Method::GET, &format!("{}/{}", api.nodes(), node), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Hub1");
    assert_eq!(body["status"], "started");
    assert_eq!(body["ports_mapping"].as_array().unwrap().len(), 8);
    assert_eq!(body["ports_mapping"][7]["name"], "Ethernet7");

    let update = json!({ "name": "Core", "ports_mapping": [{ "name": "uplink", "port_number": 0 }] });
    let (status, body) = api
        .send(Method::PUT, &format!("{}/{}", api.nodes(), node), Some(update))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Core");
    assert_eq!(body["ports_mapping"].as_array().unwrap().len(), 1);

    let (status, _) = api.send(Method::DELETE, &format!("{}/{}", api.nodes(), node), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = api.send(Method::GET, &format!("{}/{}", api.nodes(), node), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "NODE_NOT_FOUND");
}

#[tokio::test]
async fn test_node_from_other_project_is_not_found() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    let uri = format!(
        "/v3/compute/projects/{}/ethernet_hub/nodes/{}",
        Uuid::new_v4(),
        node
    );
    let (status, _) = api.send(Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_node_id_conflicts() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    let (status, body) = api
        .send(Method::POST, &api.nodes(), Some(json!({ "name": "Hub2", "node_id": node })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_start_stop_suspend_are_noops() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    for action in ["start", "stop", "suspend"] {
        let (status, _) = api
            .send(Method::POST, &format!("{}/{}/{}", api.nodes(), node, action), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT, "{}", action);
    }
    let (status, _) = api
        .send(Method::POST, &format!("{}/{}/start", api.nodes(), Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_copies_port_layout() {
    let api = setup();
    let source = api.create_hub("Hub1").await;
    let destination = api.create_hub("Hub2").await;
    let update = json!({ "ports_mapping": [{ "name": "uplink", "port_number": 4 }] });
    api.send(Method::PUT, &format!("{}/{}", api.nodes(), source), Some(update))
        .await;

    let (status, body) = api
        .send(
            Method::POST,
            &format!("{}/{}/duplicate", api.nodes(), source),
            Some(json!({ "destination_node_id": destination })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["node_id"], destination.as_str());
    assert_eq!(body["ports_mapping"][0]["name"], "uplink");

    let (status, _) = api
        .send(
            Method::POST,
            &format!("{}/{}/duplicate", api.nodes(), source),
            Some(json!({ "destination_node_id": Uuid::new_v4() })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_nio_lifecycle() {
    let api = setup();
    let node = api.create_hub("Hub1").await;

    // hubs have one adapter; any adapter number addresses it
    assert_eq!(api.attach_udp(&node, 0, 30000).await, StatusCode::CREATED);
    let nio = json!({ "type": "nio_null" });
    let (status, body) = api
        .send(Method::POST, &format!("{}/nio", api.port(&node, 3, 0)), Some(nio))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "PORT_OCCUPIED");

    // the lport is held by the first NIO
    assert_eq!(api.attach_udp(&node, 1, 30000).await, StatusCode::CONFLICT);
    // unknown port
    assert_eq!(api.attach_udp(&node, 42, 30002).await, StatusCode::NOT_FOUND);

    let (status, _) = api
        .send(Method::DELETE, &format!("{}/nio", api.port(&node, 0, 0)), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = api
        .send(Method::DELETE, &format!("{}/nio", api.port(&node, 0, 0)), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "NIO_NOT_FOUND");

    // released on detach
    assert_eq!(api.attach_udp(&node, 1, 30000).await, StatusCode::CREATED);
}

#[tokio::test]
async fn test_udp_nio_without_lport_gets_one() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    let nio = json!({ "type": "nio_udp", "rhost": "127.0.0.1", "rport": 40000 });
    let (status, body) = api
        .send(Method::POST, &format!("{}/nio", api.port(&node, 0, 0)), Some(nio))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["lport"], 30000);

    let reserved = api.dynamips.port_manager().unwrap().reserved_udp_ports().unwrap();
    assert_eq!(reserved, vec![30000]);
}

#[tokio::test]
async fn test_ports_locked_while_connected() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    assert_eq!(api.attach_udp(&node, 2, 30010).await, StatusCode::CREATED);

    let update = json!({ "ports_mapping": [{ "name": "uplink", "port_number": 0 }] });
    let (status, body) = api
        .send(Method::PUT, &format!("{}/{}", api.nodes(), node), Some(update))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "HUB_IN_USE");
}

#[tokio::test]
async fn test_capture_lifecycle() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    let start = format!("{}/start_capture", api.port(&node, 0, 0));
    let stop = format!("{}/stop_capture", api.port(&node, 0, 0));
    let capture = json!({ "capture_file_name": "cap1.pcap", "data_link_type": "DLT_EN10MB" });

    let (status, _) = api.send(Method::POST, &start, Some(capture.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert_eq!(api.attach_udp(&node, 0, 30020).await, StatusCode::CREATED);
    let (status, body) = api.send(Method::POST, &start, Some(capture.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let path = body["pcap_file_path"].as_str().unwrap().to_string();
    assert!(path.ends_with("cap1.pcap"));
    assert!(path.contains("project-files"));
    assert!(std::path::Path::new(&path).exists());

    let (status, body) = api.send(Method::POST, &start, Some(capture)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "CAPTURE_ALREADY_RUNNING");

    let (status, _) = api.send(Method::POST, &stop, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = api.send(Method::POST, &stop, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "CAPTURE_NOT_RUNNING");
}

#[tokio::test]
async fn test_capture_rejects_bad_input() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    assert_eq!(api.attach_udp(&node, 0, 30030).await, StatusCode::CREATED);
    let start = format!("{}/start_capture", api.port(&node, 0, 0));

    let bad_link = json!({ "capture_file_name": "cap.pcap", "data_link_type": "DLT_BOGUS" });
    let (status, body) = api.send(Method::POST, &start, Some(bad_link)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_REQUEST");

    let escape = json!({ "capture_file_name": "../../escape.pcap" });
    let (status, _) = api.send(Method::POST, &start, Some(escape)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // link type defaults to ethernet
    let plain = json!({ "capture_file_name": "plain.pcap" });
    let (status, _) = api.send(Method::POST, &start, Some(plain)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_pcap_stream_without_capture() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    assert_eq!(api.pcap(&node, 0).await.status(), StatusCode::NOT_FOUND);

    assert_eq!(api.attach_udp(&node, 0, 30040).await, StatusCode::CREATED);
    assert_eq!(api.pcap(&node, 0).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pcap_stream_ends_when_capture_stops() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    assert_eq!(api.attach_udp(&node, 0, 30050).await, StatusCode::CREATED);
    let (status, _) = api
        .send(
            Method::POST,
            &format!("{}/start_capture", api.port(&node, 0, 0)),
            Some(json!({ "capture_file_name": "stream.pcap", "data_link_type": "DLT_PPP_SERIAL" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let response = api.pcap(&node, 0).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.tcpdump.pcap"
    );

    let (status, _) = api
        .send(Method::POST, &format!("{}/stop_capture", api.port(&node, 0, 0)), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 24);
    assert_eq!(&bytes[0..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
    // DLT_PPP_SERIAL
    assert_eq!(bytes[20], 50);
}

#[tokio::test]
async fn test_stream_follows_capture_until_detach() {
    let api = setup();
    let node = api.create_hub("HubA").await;
    assert_eq!(api.attach_udp(&node, 0, 30060).await, StatusCode::CREATED);
    api.send(
        Method::POST,
        &format!("{}/start_capture", api.port(&node, 0, 0)),
        Some(json!({ "capture_file_name": "cap1.pcap" })),
    )
    .await;

    let response = api.pcap(&node, 0).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();

    let mut received = 0;
    while received < 24 {
        received += body.next().await.unwrap().unwrap().len();
    }
    // a frame arriving on the NIO's local UDP port
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(&[0xab; 64], "127.0.0.1:30060").await.unwrap();
    while received < 24 + 16 + 64 {
        received += body.next().await.unwrap().unwrap().len();
    }

    let (status, _) = api
        .send(Method::DELETE, &format!("{}/nio", api.port(&node, 0, 0)), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.next().await.is_none());

    assert_eq!(api.pcap(&node, 0).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_ends_on_scheduler_stop() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    assert_eq!(api.attach_udp(&node, 0, 30070).await, StatusCode::CREATED);
    api.send(
        Method::POST,
        &format!("{}/start_capture", api.port(&node, 0, 0)),
        Some(json!({ "capture_file_name": "live.pcap" })),
    )
    .await;

    let response = api.pcap(&node, 0).await;
    api.scheduler.cancel();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 24);
}

#[tokio::test]
async fn test_concurrent_start_capture() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    assert_eq!(api.attach_udp(&node, 0, 30080).await, StatusCode::CREATED);
    let start = format!("{}/start_capture", api.port(&node, 0, 0));

    let (a, b) = tokio::join!(
        api.send(Method::POST, &start, Some(json!({ "capture_file_name": "a.pcap" }))),
        api.send(Method::POST, &start, Some(json!({ "capture_file_name": "b.pcap" }))),
    );
    let mut statuses = vec![a.0, b.0];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
}

#[tokio::test]
async fn test_unload_clears_nodes() {
    let api = setup();
    let node = api.create_hub("Hub1").await;
    assert_eq!(api.attach_udp(&node, 0, 30090).await, StatusCode::CREATED);

    api.dynamips.unload().await.unwrap();
    let (status, _) = api.send(Method::GET, &format!("{}/{}", api.nodes(), node), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let reserved = api.dynamips.port_manager().unwrap().reserved_udp_ports().unwrap();
    assert!(reserved.is_empty());
}

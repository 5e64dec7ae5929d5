//! End-to-end tests through the service layer and the HTTP router

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use netmesh_common::{Database, Error, IncidentKind, SecurityIncident};
use netmesh_control::meshnet::service::{
    CreateGroup, CreateNetwork, CreatePeer, CreatePolicy, CreateRoute, NetworkService, NoopNotifier,
    ServiceOptions, UpdateGroup,
};
use netmesh_control::{ControlConfig, ControlServer};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as WsMessage};
use tower::ServiceExt;
use uuid::Uuid;

const ADMIN: &str = "admin-secret";

// ============================================================================
// Service-level scenario
// ============================================================================

struct Mesh {
    service: NetworkService,
    network_id: Uuid,
    jump_id: Uuid,
    route_id: Uuid,
    group_id: Uuid,
}

fn mesh() -> Mesh {
    let service = NetworkService::new(
        Database::open_memory().unwrap(),
        ServiceOptions::default(),
        Arc::new(NoopNotifier),
    );
    let network = service
        .create_network(CreateNetwork {
            name: "N".into(),
            cidr: "10.0.0.0/24".into(),
            domain: None,
        })
        .unwrap();
    let jump = service
        .create_peer(
            network.id,
            CreatePeer {
                name: "j".into(),
                is_jump: true,
                ..Default::default()
            },
        )
        .unwrap();
    let route = service
        .create_route(
            network.id,
            CreateRoute {
                name: "r".into(),
                description: String::new(),
                destination_cidr: "10.0.1.0/24".into(),
                jump_peer_id: jump.peer.id,
                domain_suffix: None,
            },
        )
        .unwrap();
    let group = service
        .create_group(
            network.id,
            CreateGroup {
                name: "G".into(),
                description: String::new(),
                priority: 10,
            },
        )
        .unwrap();
    service
        .attach_route(network.id, group.id, route.id)
        .unwrap();

    Mesh {
        service,
        network_id: network.id,
        jump_id: jump.peer.id,
        route_id: route.id,
        group_id: group.id,
    }
}

#[test]
fn circular_routing_is_rejected_in_both_orders() {
    let m = mesh();

    let err = m
        .service
        .add_peer_to_group(m.network_id, m.group_id, m.jump_id)
        .unwrap_err();
    assert!(matches!(err, Error::CircularRouting { .. }), "{err}");
    let group = m.service.get_group(m.network_id, m.group_id).unwrap();
    assert!(!group.peer_ids.contains(&m.jump_id));

    m.service
        .detach_route(m.network_id, m.group_id, m.route_id)
        .unwrap();
    m.service
        .add_peer_to_group(m.network_id, m.group_id, m.jump_id)
        .unwrap();

    let err = m
        .service
        .attach_route(m.network_id, m.group_id, m.route_id)
        .unwrap_err();
    assert!(matches!(err, Error::CircularRouting { .. }), "{err}");
    let group = m.service.get_group(m.network_id, m.group_id).unwrap();
    assert!(group.route_ids.is_empty());
}

#[test]
fn route_requires_jump_gateway() {
    let m = mesh();
    let plain = m
        .service
        .create_peer(
            m.network_id,
            CreatePeer {
                name: "laptop".into(),
                ..Default::default()
            },
        )
        .unwrap();

    let err = m
        .service
        .create_route(
            m.network_id,
            CreateRoute {
                name: "bad".into(),
                description: String::new(),
                destination_cidr: "10.9.0.0/24".into(),
                jump_peer_id: plain.peer.id,
                domain_suffix: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
    assert_eq!(m.service.list_routes(m.network_id).unwrap().len(), 1);
}

#[test]
fn reserved_groups_are_immutable() {
    let m = mesh();
    let groups = m.service.list_groups(m.network_id).unwrap();
    let quarantine = groups.iter().find(|g| g.is_quarantine()).unwrap();
    assert_eq!(quarantine.priority, 0);

    let err = m
        .service
        .update_group(
            m.network_id,
            quarantine.id,
            UpdateGroup {
                priority: Some(5),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::ImmutableField { .. }));

    let default = groups.iter().find(|g| g.name == "default").unwrap();
    let err = m
        .service
        .update_group(
            m.network_id,
            default.id,
            UpdateGroup {
                name: Some("everyone".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::ImmutableField { .. }));

    let after = m.service.list_groups(m.network_id).unwrap();
    assert_eq!(groups, after);
}

#[test]
fn compiled_config_is_deterministic() {
    let m = mesh();
    let laptop = m
        .service
        .create_peer(
            m.network_id,
            CreatePeer {
                name: "laptop".into(),
                ..Default::default()
            },
        )
        .unwrap();
    m.service
        .add_peer_to_group(m.network_id, m.group_id, laptop.peer.id)
        .unwrap();
    let first = m.service.compile_peer(m.network_id, laptop.peer.id).unwrap();
    let second = m.service.compile_peer(m.network_id, laptop.peer.id).unwrap();
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );

    // The laptop reaches the routed destination through the jump peer
    let via_jump = first
        .config
        .peers
        .iter()
        .find(|p| p.peer_id == m.jump_id)
        .unwrap();
    assert!(via_jump
        .allowed_ips
        .contains(&"10.0.1.0/24".parse().unwrap()));
}

#[test]
fn incidents_can_be_resolved() {
    let m = mesh();
    let incident = SecurityIncident {
        id: Uuid::new_v4(),
        network_id: m.network_id,
        peer_id: m.jump_id,
        kind: IncidentKind::RapidEndpointChange,
        detail: "endpoint changed again after 5s".into(),
        endpoints: vec!["1.1.1.1:1".into(), "2.2.2.2:1".into()],
        detected_at: 0,
        resolved: false,
    };
    m.service
        .database()
        .transaction(|s| s.put_incident(&incident))
        .unwrap();

    let resolved = m
        .service
        .resolve_incident(m.network_id, incident.id)
        .unwrap();
    assert!(resolved.resolved);
    assert!(m.service.list_incidents(m.network_id).unwrap()[0].resolved);

    let err = m
        .service
        .resolve_incident(Uuid::new_v4(), incident.id)
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn reorder_requires_exact_set() {
    let m = mesh();
    let ids: Vec<Uuid> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            let policy = m
                .service
                .create_policy(
                    m.network_id,
                    CreatePolicy {
                        name: name.to_string(),
                        description: String::new(),
                        rules: vec![],
                    },
                )
                .unwrap();
            m.service
                .attach_policy(m.network_id, m.group_id, policy.id)
                .unwrap();
            policy.id
        })
        .collect();

    let reversed: Vec<Uuid> = ids.iter().rev().copied().collect();
    m.service
        .reorder_policies(m.network_id, m.group_id, reversed.clone())
        .unwrap();
    assert_eq!(
        m.service.get_group(m.network_id, m.group_id).unwrap().policy_ids,
        reversed
    );

    for bad in [
        vec![ids[0], ids[1]],
        vec![ids[0], ids[1], ids[2], Uuid::new_v4()],
        vec![ids[0], ids[0], ids[1]],
    ] {
        let err = m
            .service
            .reorder_policies(m.network_id, m.group_id, bad)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOrder(_)), "{err}");
    }
    assert_eq!(
        m.service.get_group(m.network_id, m.group_id).unwrap().policy_ids,
        reversed
    );
}

// ============================================================================
// HTTP
// ============================================================================

fn app() -> Router {
    let config = ControlConfig {
        admin_token: Some(ADMIN.into()),
        ..Default::default()
    };
    ControlServer::new(config, Database::open_memory().unwrap())
        .unwrap()
        .router()
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn admin(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    call(app, method, uri, Some(ADMIN), body).await
}

fn id(value: &Value) -> String {
    value["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_public() {
    let app = app();
    let (status, body) = call(&app, "GET", "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connected_agents"], 0);
    assert_eq!(body["pending_captive_tokens"], 0);
}

#[tokio::test]
async fn admin_routes_require_token() {
    let app = app();
    let (status, body) = call(&app, "GET", "/api/networks", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "unauthorized");

    let (status, _) = call(&app, "GET", "/api/networks", Some("wrong"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = admin(&app, "GET", "/api/networks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn end_to_end_over_http() {
    let app = app();

    let (status, network) = admin(
        &app,
        "POST",
        "/api/networks",
        Some(json!({"name": "N", "cidr": "10.0.0.0/24"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let nid = id(&network);
    let base = format!("/api/networks/{}", nid);

    let (status, jump) = admin(
        &app,
        "POST",
        &format!("{}/peers", base),
        Some(json!({"name": "j", "is_jump": true})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let jid = jump["peer"]["id"].as_str().unwrap().to_string();
    assert!(jump["enrollment_token"].as_str().is_some());
    assert!(jump["private_key"].as_str().is_some());

    let (status, route) = admin(
        &app,
        "POST",
        &format!("{}/routes", base),
        Some(json!({"name": "r", "destination_cidr": "10.0.1.0/24", "jump_peer_id": jid})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let rid = id(&route);
    assert_eq!(route["domain_suffix"], "internal");

    let (status, group) = admin(
        &app,
        "POST",
        &format!("{}/groups", base),
        Some(json!({"name": "G", "priority": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let gid = id(&group);

    let (status, _) = admin(&app, "PUT", &format!("{}/groups/{}/routes/{}", base, gid, rid), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = admin(&app, "PUT", &format!("{}/groups/{}/peers/{}", base, gid, jid), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "circular_routing");

    let (status, _) = admin(&app, "DELETE", &format!("{}/groups/{}/routes/{}", base, gid, rid), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = admin(&app, "PUT", &format!("{}/groups/{}/peers/{}", base, gid, jid), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = admin(&app, "PUT", &format!("{}/groups/{}/routes/{}", base, gid, rid), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "circular_routing");

    // DNS mappings must stay inside the route destination
    let (status, body) = admin(
        &app,
        "POST",
        &format!("{}/routes/{}/dns", base, rid),
        Some(json!({"name": "db", "ip_address": "10.0.2.5"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "dns_mapping_out_of_range");

    let (status, mapping) = admin(
        &app,
        "POST",
        &format!("{}/routes/{}/dns", base, rid),
        Some(json!({"name": "db", "ip_address": "10.0.1.5"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(mapping["fqdn"], "db.r.internal");

    // Quarantine stays pinned
    let (_, groups) = admin(&app, "GET", &format!("{}/groups", base), None).await;
    let quarantine = groups
        .as_array()
        .unwrap()
        .iter()
        .find(|g| g["name"] == "quarantine")
        .unwrap()
        .clone();
    let (status, body) = admin(
        &app,
        "PATCH",
        &format!("{}/groups/{}", base, id(&quarantine)),
        Some(json!({"priority": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "immutable_field");

    // Preview of the compiled configuration
    let (status, config) = admin(&app, "GET", &format!("{}/peers/{}/config", base, jid), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["config"]["interface"]["is_jump"], true);
    assert_eq!(config["whitelist"], json!([]));

    let (status, _) = admin(&app, "DELETE", &base, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = admin(&app, "GET", &base, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn cidr_suggestion() {
    let app = app();

    let (status, body) = admin(
        &app,
        "GET",
        "/api/cidr/suggest?base_cidr=10.0.0.0/24&max_peers=50&count=1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prefix"], 25);
    assert_eq!(body["usable_hosts"], 126);
    assert_eq!(body["cidrs"], json!(["10.0.0.0/25"]));

    let (status, body) = admin(
        &app,
        "GET",
        "/api/cidr/suggest?base_cidr=10.0.0.0/24&max_peers=130&count=1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "capacity");
}

#[tokio::test]
async fn captive_portal_over_http() {
    let app = app();

    let (_, network) = admin(
        &app,
        "POST",
        "/api/networks",
        Some(json!({"name": "corp", "cidr": "10.40.0.0/24"})),
    )
    .await;
    let base = format!("/api/networks/{}", id(&network));
    let (_, gateway) = admin(
        &app,
        "POST",
        &format!("{}/peers", base),
        Some(json!({"name": "gw", "is_jump": true})),
    )
    .await;
    let gid = gateway["peer"]["id"].as_str().unwrap().to_string();
    let gateway_token = gateway["enrollment_token"].as_str().unwrap().to_string();

    // Agents authenticate with their enrollment token, not the admin token
    let (status, _) = call(&app, "POST", "/api/agent/captive-token", Some(ADMIN), Some(json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, issued) = call(
        &app,
        "POST",
        "/api/agent/captive-token",
        Some(&gateway_token),
        Some(json!({"client_ip": "192.168.8.20"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(issued["expires_in"], 300);
    let captive_token = issued["token"].as_str().unwrap().to_string();

    let (status, entry) = call(
        &app,
        "POST",
        "/api/captive/authenticate",
        None,
        Some(json!({"captive_token": captive_token, "peer_ip": "192.168.8.20"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["ip"], "192.168.8.20");

    // Single use
    let (status, _) = call(
        &app,
        "POST",
        "/api/captive/authenticate",
        None,
        Some(json!({"captive_token": captive_token, "peer_ip": "192.168.8.20"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, listed) = admin(&app, "GET", &format!("{}/peers/{}/whitelist", base, gid), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (_, config) = admin(&app, "GET", &format!("{}/peers/{}/config", base, gid), None).await;
    assert_eq!(config["whitelist"], json!(["192.168.8.20"]));

    let (status, _) = admin(
        &app,
        "DELETE",
        &format!("{}/peers/{}/whitelist/192.168.8.20", base, gid),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn rotated_token_replaces_old_one() {
    let app = app();
    let (_, network) = admin(
        &app,
        "POST",
        "/api/networks",
        Some(json!({"name": "lab", "cidr": "10.50.0.0/24"})),
    )
    .await;
    let base = format!("/api/networks/{}", id(&network));
    let (_, gateway) = admin(
        &app,
        "POST",
        &format!("{}/peers", base),
        Some(json!({"name": "edge", "is_jump": true})),
    )
    .await;
    let pid = gateway["peer"]["id"].as_str().unwrap().to_string();
    let old = gateway["enrollment_token"].as_str().unwrap().to_string();

    let (status, rotated) = admin(&app, "POST", &format!("{}/peers/{}/token", base, pid), None).await;
    assert_eq!(status, StatusCode::OK);
    let new = rotated["enrollment_token"].as_str().unwrap().to_string();
    assert_ne!(old, new);

    let (status, _) = call(&app, "POST", "/api/agent/captive-token", Some(&old), Some(json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(&app, "POST", "/api/agent/captive-token", Some(&new), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Agent socket
// ============================================================================

type AgentSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect_agent(addr: SocketAddr, token: &str) -> AgentSocket {
    let mut request = format!("ws://{}/api/agent/ws", addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token).parse().unwrap(),
    );
    let (socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    socket
}

/// Next text frame as JSON, skipping control frames
async fn next_json(socket: &mut AgentSocket) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = socket.next().await.unwrap().unwrap();
            if msg.is_text() {
                break serde_json::from_str(msg.to_text().unwrap()).unwrap();
            }
        }
    })
    .await
    .unwrap()
}

async fn wait_for_hostname(service: &NetworkService, network_id: Uuid, peer_id: Uuid, hostname: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let peer = service.get_peer(network_id, peer_id).unwrap();
            if peer.hostname.as_deref() == Some(hostname) {
                assert!(peer.last_seen_at.is_some());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn agent_socket_survives_malformed_heartbeats() {
    let server = ControlServer::new(ControlConfig::default(), Database::open_memory().unwrap()).unwrap();
    let state = server.state();
    let network = state
        .service
        .create_network(CreateNetwork {
            name: "socket".into(),
            cidr: "10.60.0.0/24".into(),
            domain: None,
        })
        .unwrap();
    let laptop = state
        .service
        .create_peer(
            network.id,
            CreatePeer {
                name: "laptop".into(),
                ..Default::default()
            },
        )
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.router();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    let mut first = connect_agent(addr, &laptop.enrollment_token).await;
    let pushed = next_json(&mut first).await;
    assert_eq!(pushed["type"], "config");

    first.send(WsMessage::text("not json")).await.unwrap();
    first.send(WsMessage::text(r#"{"peer_endpoints": []}"#)).await.unwrap();
    first
        .send(WsMessage::text(r#"{"hostname": "laptop.local", "peer_endpoints": []}"#))
        .await
        .unwrap();
    wait_for_hostname(&state.service, network.id, laptop.peer.id, "laptop.local").await;

    // Still reading after the garbage
    first
        .send(WsMessage::text(r#"{"hostname": "laptop-2.local"}"#))
        .await
        .unwrap();
    wait_for_hostname(&state.service, network.id, laptop.peer.id, "laptop-2.local").await;
    assert_eq!(state.distribution.registry().connection_count().await, 1);

    // A second connection for the same peer supersedes the first
    let mut second = connect_agent(addr, &laptop.enrollment_token).await;
    assert_eq!(next_json(&mut second).await["type"], "config");
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Err(_)) => break,
                Some(Ok(msg)) if msg.is_close() => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "replaced connection stayed open");
    assert_eq!(state.distribution.registry().connection_count().await, 1);

    second
        .send(WsMessage::text(r#"{"hostname": "laptop-3.local"}"#))
        .await
        .unwrap();
    wait_for_hostname(&state.service, network.id, laptop.peer.id, "laptop-3.local").await;
}

#[tokio::test]
async fn agent_socket_rejects_unknown_token() {
    let server = ControlServer::new(ControlConfig::default(), Database::open_memory().unwrap()).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.router();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    let mut request = format!("ws://{}/api/agent/ws", addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_err());
}

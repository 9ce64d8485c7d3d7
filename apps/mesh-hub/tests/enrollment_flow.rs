//! Drives a real `MeshChannel` over its actual TCP transport: a plain
//! socket plays the role of an unenrolled device sending `ENROLL_REQUEST`
//! and reading back the hub's `ENROLL_RESPONSE` (spec §4.5, §4.15).

use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use mesh_core::{Envelope, MessageType};
use mesh_hub::channel::MeshChannel;
use mesh_hub::config::HubConfig;
use mesh_wire::{read_envelope, write_envelope, DEFAULT_MAX_FRAME_SIZE};
use serde_json::Value;
use tokio::net::TcpStream;

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

fn test_config(dir: &std::path::Path, tcp_port: u16) -> HubConfig {
    HubConfig {
        node_id: "hub-under-test".to_string(),
        tcp_port,
        udp_port: free_port(),
        key_store_path: dir.join("keys.json"),
        registry_path: dir.join("registry.json"),
        automation_rules_path: dir.join("rules.json"),
        firmware_dir: dir.join("firmware"),
        federation_config_path: dir.join("federation.json"),
        ca_dir: dir.join("ca"),
        psk_auth_enabled: false,
        encryption_enabled: false,
        ..HubConfig::default()
    }
}

#[tokio::test]
async fn device_completes_enrollment_and_receives_a_psk() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let channel = MeshChannel::new(test_config(dir.path(), port)).unwrap();
    channel.start().await.expect("channel starts");

    let pin = channel.begin_enrollment();
    let proof = mesh_enroll::compute_pin_proof(&pin, "esp32-kitchen");

    // Give the accept loop a moment to come up before dialing in.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect to hub");

    let mut request = Envelope::new(MessageType::EnrollRequest, "esp32-kitchen", "hub-under-test", 0.0);
    request.payload.insert("name".to_string(), Value::String("kitchen sensor".to_string()));
    request.payload.insert("pin_proof".to_string(), Value::String(proof));
    write_envelope(&mut stream, &request, DEFAULT_MAX_FRAME_SIZE).await.expect("write enroll request");

    let response = read_envelope(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.expect("enroll response");
    assert_eq!(response.kind, MessageType::EnrollResponse);
    assert_eq!(response.payload.get("status").and_then(Value::as_str), Some("ok"));
    assert!(response.payload.get("encrypted_psk").is_some());
    assert!(response.payload.get("salt").is_some());

    channel.stop();
}

#[tokio::test]
async fn wrong_pin_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let channel = MeshChannel::new(test_config(dir.path(), port)).unwrap();
    channel.start().await.expect("channel starts");
    channel.begin_enrollment();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect to hub");

    let mut request = Envelope::new(MessageType::EnrollRequest, "esp32-kitchen", "hub-under-test", 0.0);
    request.payload.insert("name".to_string(), Value::String("kitchen sensor".to_string()));
    request.payload.insert("pin_proof".to_string(), Value::String("0000000000000000000000000000000000000000000000000000000000000000".to_string()));
    write_envelope(&mut stream, &request, DEFAULT_MAX_FRAME_SIZE).await.expect("write enroll request");

    let response = read_envelope(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.expect("enroll response");
    assert_eq!(response.payload.get("status").and_then(Value::as_str), Some("error"));
    assert_eq!(response.payload.get("reason").and_then(Value::as_str), Some("invalid_pin"));

    channel.stop();
}

//! End-to-end exercise of the control API (spec §6.1) against the binary
//! running with `--test-mode`: synthetic cameras report signal immediately,
//! so cold start reaches STREAMING without real capture hardware or a real
//! media server. Mirrors the teacher's `TestServer`-spawns-the-binary shape,
//! generalized from a WebRTC signaling smoke test to this surface.

use std::net::TcpListener;
use std::process::{Child, Command};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;

struct TestServer {
    process: Child,
    base_url: String,
    _config_dir: tempfile::TempDir,
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

impl TestServer {
    async fn start() -> Self {
        let config_dir = tempfile::tempdir().expect("tempdir");
        let recording_root = config_dir.path().join("recordings");
        std::fs::create_dir_all(&recording_root).unwrap();
        let port = free_port();

        let config_toml = format!(
            r#"
            [server]
            bind-ip = "127.0.0.1"
            api-port = {port}

            [[cameras]]
            id = "cam0"
            device = "/dev/video0"

            [[cameras]]
            id = "cam1"
            device = "/dev/video1"

            [recording]
            root = "{root}"

            [supervisor]
            tick-seconds = 2
            "#,
            port = port,
            root = recording_root.display(),
        );
        let config_path = config_dir.path().join("config.toml");
        std::fs::write(&config_path, config_toml).unwrap();

        let process = Command::new(env!("CARGO_BIN_EXE_camswitch-core"))
            .arg("--test-mode")
            .arg("--config")
            .arg(&config_path)
            .spawn()
            .expect("failed to start camswitch-core test binary");

        let server = TestServer {
            process,
            base_url: format!("http://127.0.0.1:{port}"),
            _config_dir: config_dir,
        };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&self) {
        let client = reqwest::Client::new();
        for _ in 0..40 {
            if let Ok(resp) = client
                .get(format!("{}/api/v1/health", self.base_url))
                .timeout(Duration::from_secs(1))
                .send()
                .await
            {
                if resp.status().is_success() {
                    return;
                }
            }
            sleep(Duration::from_millis(250)).await;
        }
        panic!("server never became ready");
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let resp = client.get(server.url("/api/v1/health")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn capabilities_lists_configured_cameras() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let resp = client.get(server.url("/api/v1/capabilities")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    let cameras = body["cameras"].as_array().unwrap();
    assert_eq!(cameras.len(), 2);
    assert_eq!(body["api_version"], "v1");
}

#[tokio::test]
async fn synthetic_cameras_reach_streaming() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    // Synthetic cameras report signal at startup; the supervisor's first tick
    // (2s in this config) promotes IDLE -> STREAMING.
    let mut last_states = Vec::new();
    for _ in 0..20 {
        let resp = client.get(server.url("/api/v1/cameras")).send().await.unwrap();
        let cameras: Vec<Value> = resp.json().await.unwrap();
        last_states = cameras.iter().map(|c| c["state"].clone()).collect();
        if last_states.iter().all(|s| s == "streaming") {
            return;
        }
        sleep(Duration::from_millis(500)).await;
    }
    panic!("cameras did not reach STREAMING in time: {last_states:?}");
}

#[tokio::test]
async fn enable_disable_camera_round_trip() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/api/v1/cameras/cam0/disable"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let resp = client.get(server.url("/api/v1/cameras")).send().await.unwrap();
    let cameras: Vec<Value> = resp.json().await.unwrap();
    let cam0 = cameras.iter().find(|c| c["camera_id"] == "cam0").unwrap();
    assert_eq!(cam0["state"], "disabled");

    let resp = client
        .post(server.url("/api/v1/cameras/cam0/enable"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn enabling_unknown_camera_returns_device_missing() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(server.url("/api/v1/cameras/does-not-exist/enable"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "device_missing");
}

async fn wait_for_streaming(client: &reqwest::Client, server: &TestServer) {
    for _ in 0..20 {
        let resp = client.get(server.url("/api/v1/cameras")).send().await.unwrap();
        let cameras: Vec<Value> = resp.json().await.unwrap();
        if cameras.iter().all(|c| c["state"] == "streaming") {
            return;
        }
        sleep(Duration::from_millis(500)).await;
    }
    panic!("cameras never reached STREAMING");
}

#[tokio::test]
async fn recording_start_stop_round_trip() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    wait_for_streaming(&client, &server).await;

    let resp = client
        .post(server.url("/api/v1/recording/start"))
        .json(&json!({ "name": "integration-test" }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "start failed: {:?}", resp.text().await);
    let body: Value = resp.json().await.unwrap();
    let session_id = body["session_id"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    let resp = client.get(server.url("/api/v1/recording/status")).send().await.unwrap();
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["id"], session_id);
    assert_eq!(status["legs"].as_array().unwrap().len(), 2);

    let resp = client
        .post(server.url("/api/v1/recording/stop"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    // Idempotent: a second stop on the now-finished session still reports ok.
    let resp = client
        .post(server.url("/api/v1/recording/stop"))
        .json(&json!({ "session_id": session_id }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn scene_crud_round_trip() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client.get(server.url("/api/v1/scenes")).send().await.unwrap();
    let scenes: Vec<Value> = resp.json().await.unwrap();
    let ids: Vec<&str> = scenes.iter().map(|s| s["scene_id"].as_str().unwrap()).collect();
    assert!(ids.contains(&"quad"));
    assert!(ids.contains(&"fullscreen_cam0"));

    let new_scene = json!({
        "scene_id": "custom-test-scene",
        "name": "Custom",
        "canvas_width": 1920,
        "canvas_height": 1080,
        "frame_rate": 30,
        "background_color": "#000000",
        "slots": [{
            "input_ref": { "type": "camera", "id": "cam0" },
            "x": 0, "y": 0, "width": 1920, "height": 1080,
            "z_order": 0, "opacity": 1.0, "audio_gain": 1.0, "visible": true
        }]
    });
    let resp = client
        .post(server.url("/api/v1/scenes"))
        .json(&new_scene)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "create failed: {:?}", resp.text().await);

    let resp = client.get(server.url("/api/v1/scenes")).send().await.unwrap();
    let scenes: Vec<Value> = resp.json().await.unwrap();
    assert!(scenes.iter().any(|s| s["scene_id"] == "custom-test-scene"));

    let resp = client
        .delete(server.url("/api/v1/scenes/custom-test-scene"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn scene_upsert_rejects_overlapping_z_order() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let bad_scene = json!({
        "scene_id": "bad-scene",
        "name": "Bad",
        "canvas_width": 1920,
        "canvas_height": 1080,
        "frame_rate": 30,
        "background_color": "#000000",
        "slots": [
            {
                "input_ref": { "type": "camera", "id": "cam0" },
                "x": 0, "y": 0, "width": 960, "height": 1080,
                "z_order": 0, "opacity": 1.0, "audio_gain": 1.0, "visible": true
            },
            {
                "input_ref": { "type": "camera", "id": "cam1" },
                "x": 960, "y": 0, "width": 960, "height": 1080,
                "z_order": 0, "opacity": 1.0, "audio_gain": 1.0, "visible": true
            }
        ]
    });
    let resp = client
        .post(server.url("/api/v1/scenes"))
        .json(&bad_scene)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mixer_start_take_cut_and_mix() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    wait_for_streaming(&client, &server).await;

    let resp = client.post(server.url("/api/v1/mixer/start")).send().await.unwrap();
    assert!(resp.status().is_success(), "mixer start failed: {:?}", resp.text().await);

    let resp = client.get(server.url("/api/v1/mixer/status")).send().await.unwrap();
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["state"], "playing");

    let resp = client
        .post(server.url("/api/v1/mixer/preview"))
        .json(&json!({ "scene_id": "fullscreen_cam1" }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let resp = client
        .post(server.url("/api/v1/mixer/take"))
        .json(&json!({ "transition": "cut" }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "take failed: {:?}", resp.text().await);

    let resp = client.get(server.url("/api/v1/mixer/status")).send().await.unwrap();
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["program_scene_id"], "fullscreen_cam1");
    assert_eq!(status["transition_in_flight"], false);
    assert!(status["tally_program"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c == "cam1"));

    let resp = client
        .post(server.url("/api/v1/mixer/preview"))
        .json(&json!({ "scene_id": "quad" }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let resp = client
        .post(server.url("/api/v1/mixer/take"))
        .json(&json!({ "transition": "mix" }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    // MIX transition runs 500ms; give it time to settle before asserting.
    sleep(Duration::from_millis(700)).await;
    let resp = client.get(server.url("/api/v1/mixer/status")).send().await.unwrap();
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["program_scene_id"], "quad");
    assert_eq!(status["transition_in_flight"], false);

    let resp = client.post(server.url("/api/v1/mixer/stop")).send().await.unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn mixer_take_without_start_is_conflict() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(server.url("/api/v1/mixer/take"))
        .json(&json!({ "transition": "cut" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "conflict");
}

#[tokio::test]
async fn disk_status_reports_thresholds() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let resp = client.get(server.url("/api/v1/disk")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert!(body["free_gb"].as_f64().unwrap() >= 0.0);
    assert!(body["warning_threshold_gb"].as_f64().unwrap() >= body["min_threshold_gb"].as_f64().unwrap());
}

#[tokio::test]
async fn events_websocket_delivers_camera_state_changes() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let ws_url = server.base_url.replacen("http://", "ws://", 1) + "/api/v1/events";
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url).await.expect("ws connect");
    let (mut write, mut read) = futures_util::StreamExt::split(ws_stream);
    futures_util::SinkExt::send(
        &mut write,
        tokio_tungstenite::tungstenite::Message::Text(
            json!({ "subscribe": ["ingest_state_changed", "signal_recovered"] }).to_string(),
        ),
    )
    .await
    .unwrap();

    // Prod the cameras into life so an event is guaranteed even if the
    // supervisor already promoted them before we connected.
    let _ = client.post(server.url("/api/v1/cameras/cam0/disable")).send().await;
    let _ = client.post(server.url("/api/v1/cameras/cam0/enable")).send().await;

    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) =
            futures_util::StreamExt::next(&mut read).await
        {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                if value.get("event").is_some() {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    assert!(found, "expected at least one event over the push channel");
}

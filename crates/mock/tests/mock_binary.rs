//! Drives the `mock-core` binary over real HTTP.

use std::io::Read;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use serde_json::{json, Value};

struct MockProcess {
    child: Child,
    base_url: String,
}

impl MockProcess {
    fn spawn(config: &Value) -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("start_config.json");
        std::fs::write(&config_path, config.to_string()).unwrap();

        let port = find_free_port();
        let child = Command::new(env!("CARGO_BIN_EXE_mock-core"))
            .arg(port.to_string())
            .arg(&config_path)
            .args(["--liveness-delay-ms", "10"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        (
            Self {
                child,
                base_url: format!("http://127.0.0.1:{}", port),
            },
            dir,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn wait_ready(&self, client: &reqwest::Client) {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) {
            if client.get(self.url("/tests/simple")).send().await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("mock server never became ready");
    }
}

impl Drop for MockProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn find_free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn blocked_ips_are_served_from_lists_endpoint() {
    let (mock, _dir) = MockProcess::spawn(&json!({"serviceId": 1}));
    let client = reqwest::Client::new();
    mock.wait_ready(&client).await;

    let response = client
        .post(mock.url("/mock/config"))
        .json(&json!({"serviceId": 1, "blockedIPAddresses": ["1.2.3.4"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(mock.url("/api/runtime/firewall/lists"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .get(mock.url("/api/runtime/firewall/lists"))
        .header("Accept-Encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-encoding"], "gzip");
    let body = response.bytes().await.unwrap();
    let mut decoded = String::new();
    GzDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
    let lists: Value = serde_json::from_str(&decoded).unwrap();
    assert_eq!(lists["blockedIPAddresses"], json!(["1.2.3.4"]));

    let config: Value = client
        .get(mock.url("/api/runtime/config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(config.get("blockedIPAddresses").is_none());
}

#[tokio::test]
async fn outage_round_trip_keeps_version() {
    let (mock, _dir) = MockProcess::spawn(&json!({"serviceId": 1}));
    let client = reqwest::Client::new();
    mock.wait_ready(&client).await;

    let before: Value = client
        .get(mock.url("/config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    client
        .post(mock.url("/api/runtime/events"))
        .header("Authorization", "AIK_RUNTIME_MOCK")
        .json(&json!({"type": "started"}))
        .send()
        .await
        .unwrap();

    client.post(mock.url("/mock/down")).send().await.unwrap();
    let response = client.get(mock.url("/config")).send().await.unwrap();
    assert_eq!(response.status(), 503);

    client.post(mock.url("/mock/up")).send().await.unwrap();
    let response = client.get(mock.url("/config")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let after: Value = response.json().await.unwrap();
    assert_eq!(after["configUpdatedAt"], before["configUpdatedAt"]);

    let events: Value = client
        .get(mock.url("/mock/events"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(events, json!([{"type": "started"}]));

    let token: Value = client
        .get(mock.url("/mock/token"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(token["token"], "AIK_RUNTIME_MOCK");
}

#[test]
fn missing_start_config_exits_non_zero() {
    let status = Command::new(env!("CARGO_BIN_EXE_mock-core"))
        .arg(find_free_port().to_string())
        .arg("/nonexistent/start_config.json")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}

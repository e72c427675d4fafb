//! Drives the HTTP control surface against a live acquisition loop

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::bounded;
use fft_slurper::{
    exfil::DataLogger,
    monitoring::{api, ControlHandle, Snapshot, SnapshotCell, COMMAND_CAPACITY},
    orchestrator::{Orchestrator, OrchestratorConfig},
};
use reqwest::StatusCode;
use serde_json::Value;
use tempfile::TempDir;

struct TestServer {
    base: String,
    client: reqwest::Client,
    dir: TempDir,
    running: Arc<AtomicBool>,
    acquisition: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn start(with_logger: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            period: Duration::from_millis(10),
            ..Default::default()
        };
        let snapshot = Arc::new(SnapshotCell::new(Snapshot::initial(
            config.fft_size,
            config.sample_rate,
        )));
        let (cmd_s, cmd_r) = bounded(COMMAND_CAPACITY);
        let logger = with_logger.then(|| DataLogger::new(dir.path()));
        let mut orchestrator =
            Orchestrator::new(config, None, logger, cmd_r, snapshot.clone()).unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let acquisition = {
            let running = running.clone();
            std::thread::spawn(move || orchestrator.run(&running))
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = api::router(ControlHandle::new(cmd_s, snapshot));
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            dir,
            running,
            acquisition: Some(acquisition),
        }
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        (resp.status(), resp.json().await.unwrap())
    }

    async fn post(&self, path: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        (resp.status(), resp.json().await.unwrap())
    }

    /// Let a few cycles go by so the snapshot catches up
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.acquisition.take() {
            let _ = handle.join();
        }
    }
}

#[tokio::test]
async fn test_snapshot() {
    let server = TestServer::start(true).await;
    server.settle().await;
    let (code, body) = server.get("/api/fft").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["fft_size"], 512);
    assert_eq!(body["num_bands"], 8);
    assert_eq!(body["time_domain"].as_array().unwrap().len(), 512);
    assert_eq!(body["magnitude"].as_array().unwrap().len(), 256);
    assert_eq!(body["psd"].as_array().unwrap().len(), 128);
    assert_eq!(body["mode"], "440 Hz Sine");
    assert!(body["cycle"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_out_of_range_mode() {
    let server = TestServer::start(true).await;
    let (code, body) = server.post("/api/mode?value=99").await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    server.settle().await;
    let (_, snap) = server.get("/api/fft").await;
    assert_eq!(snap["mode_index"], 1);

    let (code, body) = server.post("/api/mode?value=banana").await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_mode_change() {
    let server = TestServer::start(true).await;
    let (code, body) = server.post("/api/mode?value=3").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["mode"], 3);
    assert_eq!(body["name"], "2000 Hz Sine");
    server.settle().await;
    let (_, snap) = server.get("/api/fft").await;
    assert_eq!(snap["mode_index"], 3);
}

#[tokio::test]
async fn test_pause_toggle() {
    let server = TestServer::start(true).await;
    let (_, body) = server.post("/api/pause").await;
    assert_eq!(body["paused"], true);
    let (_, body) = server.post("/api/pause").await;
    assert_eq!(body["paused"], false);
}

#[tokio::test]
async fn test_not_found() {
    let server = TestServer::start(true).await;
    let (code, body) = server.get("/api/nope").await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "not found");
}

#[tokio::test]
async fn test_logging_lifecycle() {
    let server = TestServer::start(true).await;
    let (code, body) = server.post("/api/log/start?format=csv").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["logging"], true);
    assert_eq!(body["format"], "csv");
    let filepath = body["filepath"].as_str().unwrap().to_owned();
    assert!(filepath.ends_with(".csv"));

    let (code, _) = server.post("/api/log/start?format=binary").await;
    assert_eq!(code, StatusCode::CONFLICT);

    let (code, _) = server.post("/api/log/directory?directory=elsewhere").await;
    assert_eq!(code, StatusCode::CONFLICT);

    server.settle().await;
    let (_, status) = server.get("/api/log/status").await;
    assert_eq!(status["logging"], true);
    assert!(status["frames"].as_u64().unwrap() > 0);

    let (code, body) = server.post("/api/log/stop").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["logging"], false);
    assert_eq!(body["filepath"], "");

    let text = std::fs::read_to_string(&filepath).unwrap();
    assert!(text.starts_with("# fftSize: 512"));
    assert!(text.lines().count() > 4);
}

#[tokio::test]
async fn test_legacy_toggle() {
    let server = TestServer::start(true).await;
    let (_, body) = server.post("/api/log/toggle").await;
    assert_eq!(body["logging"], true);
    assert_eq!(body["format"], "binary");
    let (_, body) = server.post("/api/log/toggle").await;
    assert_eq!(body["logging"], false);
}

#[tokio::test]
async fn test_auto_record_and_directory() {
    let server = TestServer::start(true).await;
    let (code, body) = server
        .post("/api/auto-record?enabled=true&threshold=150.5")
        .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["threshold"], 150.5);

    let target = server.dir.path().join("moved");
    let (code, body) = server
        .post(&format!(
            "/api/log/directory?directory={}/",
            target.display()
        ))
        .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["directory"], target.display().to_string());

    server.settle().await;
    let (_, body) = server.get("/api/auto-record").await;
    assert_eq!(body["enabled"], true);
    let (_, body) = server.get("/api/log/directory").await;
    assert_eq!(body["directory"], target.display().to_string());
}

#[tokio::test]
async fn test_without_logger() {
    let server = TestServer::start(false).await;
    server.settle().await;
    let (code, body) = server.post("/api/log/start").await;
    assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    let (code, _) = server.get("/api/log/status").await;
    assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
}

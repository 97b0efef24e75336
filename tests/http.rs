mod common;

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use common::{KeywordEmbedder, ScriptedModel};
use docchat::app::App;
use docchat::config::load_config;
use docchat::server::router;

struct TestServer {
    _tmp: TempDir,
    app: Arc<App>,
    base: String,
    client: reqwest::Client,
}

async fn start(model: ScriptedModel) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("docchat.toml");
    std::fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{root}/docchat.sqlite\"\n\n[storage]\nroot = \"{root}/uploads\"\n",
            root = tmp.path().display()
        ),
    )
    .unwrap();
    let config = load_config(Path::new(&config_path)).unwrap();

    let app = Arc::new(
        App::with_providers(&config, Arc::new(KeywordEmbedder::new()), Arc::new(model))
            .await
            .unwrap(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = router(app.clone());
    tokio::spawn(async move {
        axum::serve(listener, routes).await.unwrap();
    });

    TestServer {
        _tmp: tmp,
        app,
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn upload(&self, filename: &str, text: &str, thread: Option<&str>) -> Value {
        let key = self.app.storage.put(filename, text.as_bytes()).await.unwrap();
        let resp = self
            .client
            .post(format!("{}/documents", self.base))
            .json(&json!({
                "filename": filename,
                "storage_key": key,
                "content_type": "text/plain",
                "thread_id": thread,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    /// Posts a message and returns the decoded SSE payloads.
    async fn converse(&self, thread: &str, content: &str) -> Vec<Value> {
        let resp = self
            .client
            .post(format!("{}/threads/{}/messages", self.base, thread))
            .json(&json!({ "content": content }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.text().await.unwrap();
        body.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()).unwrap())
            .collect()
    }
}

#[tokio::test]
async fn test_health() {
    let server = start(ScriptedModel::new(&["x"])).await;
    let body: Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_register_ingest_and_converse() {
    let server = start(ScriptedModel::new(&["Pears ", "ripen indoors."])).await;

    let doc = server
        .upload("pears.txt", "Pears ripen slowly indoors after harvest.", Some("t1"))
        .await;
    assert_eq!(doc["status"], "pending");
    let id = doc["id"].as_str().unwrap();

    let resp = server
        .client
        .post(format!("{}/documents/{}/ingest", server.base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "indexed");

    let events = server.converse("t1", "When do pears ripen?").await;
    let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(types, vec!["sources", "text", "text", "end"]);
    assert_eq!(events[0]["content"][0]["document_id"], id);
    assert_eq!(events[3]["content"]["content"], "Pears ripen indoors.");

    let thread: Value = server
        .client
        .get(format!("{}/threads/t1", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = thread["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
}

#[tokio::test]
async fn test_unindex_resets_document() {
    let server = start(ScriptedModel::new(&["x"])).await;
    let doc = server.upload("a.txt", "Apples are crisp.", None).await;
    let id = doc["id"].as_str().unwrap();

    server
        .client
        .post(format!("{}/documents/{}/ingest", server.base, id))
        .send()
        .await
        .unwrap();
    let body: Value = server
        .client
        .delete(format!("{}/documents/{}/index", server.base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["removed"], 1);

    let doc: Value = server
        .client
        .get(format!("{}/documents/{}", server.base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(doc["status"], "pending");
}

#[tokio::test]
async fn test_error_contract() {
    let server = start(ScriptedModel::new(&["x"])).await;

    let resp = server
        .client
        .get(format!("{}/documents/missing", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = server
        .client
        .post(format!("{}/threads/t1/messages", server.base))
        .json(&json!({ "content": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .delete(format!("{}/threads/t1/turn", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_unsupported_format_is_415() {
    let server = start(ScriptedModel::new(&["x"])).await;
    let key = server.app.storage.put("blob.bin", &[0, 1, 2]).await.unwrap();
    let doc: Value = server
        .client
        .post(format!("{}/documents", server.base))
        .json(&json!({ "filename": "blob.bin", "storage_key": key }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let resp = server
        .client
        .post(format!("{}/documents/{}/ingest", server.base, doc["id"].as_str().unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unsupported_format");
}

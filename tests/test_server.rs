//! Integration tests for the MCP server tools via duplex transport.
//!
//! Uses `tokio::io::duplex` to create an in-process transport, connects a
//! test client to the agentremote server (backed by `LocalTransport` so the
//! tests don't need a real remote host), and exercises the fixed eight-tool
//! catalog through the MCP protocol.

use agentremote::server::AgentRemoteServer;
use agentremote::transport::local::LocalTransport;
use agentremote::transport::Transport;
use rmcp::model::*;
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default, Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

async fn setup() -> rmcp::service::RunningService<
    rmcp::service::RoleClient,
    impl rmcp::service::Service<rmcp::service::RoleClient>,
> {
    let (server_transport, client_transport) = tokio::io::duplex(65536);

    let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
    let server = AgentRemoteServer::new(transport);
    tokio::spawn(async move {
        let service = server.serve(server_transport).await.unwrap();
        let _ = service.waiting().await;
    });

    let client = TestClient::default();
    client.serve(client_transport).await.unwrap()
}

async fn call_tool(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    name: &str,
    args: Value,
) -> Value {
    let params = CallToolRequestParams {
        meta: None,
        name: name.to_string().into(),
        arguments: Some(serde_json::from_value(args).unwrap()),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();

    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult, got {response:?}");
    };

    let text = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text))
}

// ---------------------------------------------------------------------------
// bash: foreground
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bash_foreground_reports_stdout_and_exit_code() {
    let client = setup().await;
    let result = call_tool(&client, "bash", serde_json::json!({"command": "printf hello"})).await;

    let text = result.as_str().unwrap();
    assert!(text.contains("hello"));
    assert!(text.contains("exit code 0"));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn bash_foreground_reports_nonzero_exit() {
    let client = setup().await;
    let result = call_tool(&client, "bash", serde_json::json!({"command": "exit 3"})).await;

    let text = result.as_str().unwrap();
    assert!(text.contains("exit code 3"));

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// bash: background + bash_output + kill_bash
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bash_background_then_bash_output_reports_completion() {
    let client = setup().await;

    let started = call_tool(
        &client,
        "bash",
        serde_json::json!({"command": "printf done", "run_in_background": true}),
    )
    .await;
    let shell_id = started["shellId"].as_str().unwrap().to_string();
    assert!(shell_id.starts_with("shell_"));

    let mut status = Value::Null;
    for _ in 0..50 {
        let out = call_tool(&client, "bash_output", serde_json::json!({"shell_id": shell_id})).await;
        status = out["status"].clone();
        if status == "completed" {
            assert!(out["stdout"].as_str().unwrap().contains("done"));
            assert_eq!(out["exitCode"], 0);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, "completed");

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn kill_bash_stops_a_running_session() {
    let client = setup().await;

    let started = call_tool(
        &client,
        "bash",
        serde_json::json!({"command": "sleep 60", "run_in_background": true}),
    )
    .await;
    let shell_id = started["shellId"].as_str().unwrap().to_string();

    let killed = call_tool(&client, "kill_bash", serde_json::json!({"shell_id": shell_id})).await;
    assert!(killed["killed"].as_bool().unwrap());

    let second = call_tool(&client, "kill_bash", serde_json::json!({"shell_id": shell_id})).await;
    assert!(!second["killed"].as_bool().unwrap());

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn bash_output_on_unknown_shell_is_error_envelope() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "bash_output",
        serde_json::json!({"shell_id": "shell_does_not_exist"}),
    )
    .await;

    let text = result.as_str().unwrap_or("");
    assert!(text.contains("no such shell id"), "got: {result}");

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// read / write / edit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_then_read_round_trips() {
    let client = setup().await;
    let path = std::env::temp_dir().join(format!("agentremote-test-{}.txt", uuid::Uuid::new_v4()));
    let path_str = path.to_str().unwrap().to_string();

    let written = call_tool(
        &client,
        "write",
        serde_json::json!({"file_path": path_str, "content": "line one\nline two\n"}),
    )
    .await;
    assert!(written.as_str().unwrap().contains("bytes"));

    let read = call_tool(&client, "read", serde_json::json!({"file_path": path_str})).await;
    let text = read.as_str().unwrap();
    assert!(text.contains("1\tline one"));
    assert!(text.contains("2\tline two"));

    std::fs::remove_file(&path).ok();
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn edit_requires_single_match_by_default() {
    let client = setup().await;
    let path = std::env::temp_dir().join(format!("agentremote-test-{}.txt", uuid::Uuid::new_v4()));
    std::fs::write(&path, "foo foo\n").unwrap();
    let path_str = path.to_str().unwrap().to_string();

    let result = call_tool(
        &client,
        "edit",
        serde_json::json!({"file_path": path_str, "old_string": "foo", "new_string": "bar"}),
    )
    .await;
    let text = result.as_str().unwrap_or("");
    assert!(text.contains("multiple matches"), "got: {result}");

    let replace_all = call_tool(
        &client,
        "edit",
        serde_json::json!({
            "file_path": path_str,
            "old_string": "foo",
            "new_string": "bar",
            "replace_all": true,
        }),
    )
    .await;
    assert_eq!(replace_all["replacements"], 2);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "bar bar\n");

    std::fs::remove_file(&path).ok();
    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// grep / glob
// ---------------------------------------------------------------------------

#[tokio::test]
async fn grep_no_matches_is_empty_success_not_error() {
    let client = setup().await;
    let dir = std::env::temp_dir().join(format!("agentremote-grep-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("a.txt"), "nothing relevant\n").unwrap();

    let result = call_tool(
        &client,
        "grep",
        serde_json::json!({"pattern": "needle", "path": dir.to_str().unwrap()}),
    )
    .await;
    assert_eq!(result.as_str().unwrap(), "");

    std::fs::remove_dir_all(&dir).ok();
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn glob_excludes_hidden_paths_by_default() {
    let client = setup().await;
    let dir = std::env::temp_dir().join(format!("agentremote-glob-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(dir.join(".git")).unwrap();
    std::fs::write(dir.join(".git").join("config.ts"), "x").unwrap();
    std::fs::write(dir.join("index.ts"), "x").unwrap();

    let result = call_tool(
        &client,
        "glob",
        serde_json::json!({"base_path": dir.to_str().unwrap(), "pattern": "**/*.ts"}),
    )
    .await;
    let text = result.as_str().unwrap();
    assert!(text.contains("index.ts"));
    assert!(!text.contains("config.ts"));

    std::fs::remove_dir_all(&dir).ok();
    client.cancel().await.unwrap();
}

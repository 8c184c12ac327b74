use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::net::TcpListener;
use std::path::Path;
use std::process::{exit, Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const SERVER_PACKAGE: &str = "parley-server";
const SMOKE_PASSWORD: &str = "smoke-password-1";

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Parley backend")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    #[command(about = "Run `cargo fmt --all`")]
    Fmt,
    #[command(about = "Run format + clippy lint checks")]
    Lint,
    #[command(about = "Execute `cargo test --workspace --all-features`")]
    Test,
    #[command(about = "Run lint then test")]
    Ci,
    #[command(about = "Boot the server with metrics, drive one chat round trip, check counters")]
    Smoke,
}

fn main() {
    let cli = Cli::parse();

    let Some(workspace_root) = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
    else {
        eprintln!("xtask must live inside the workspace");
        exit(1);
    };

    let ok = match cli.command {
        Task::Fmt => run_commands(&workspace_root, &[&["fmt", "--all"]]),
        Task::Lint => lint(&workspace_root),
        Task::Test => test(&workspace_root),
        Task::Ci => lint(&workspace_root) && test(&workspace_root),
        Task::Smoke => smoke(&workspace_root),
    };

    if !ok {
        exit(1);
    }
}

fn lint(workspace_root: &Path) -> bool {
    run_commands(
        workspace_root,
        &[
            &["fmt", "--all", "--", "--check"],
            &["clippy", "--workspace", "--all-features", "--", "-D", "warnings"],
        ],
    )
}

fn test(workspace_root: &Path) -> bool {
    run_commands(workspace_root, &[&["test", "--workspace", "--all-features"]])
}

fn smoke(workspace_root: &Path) -> bool {
    if !run_commands(
        workspace_root,
        &[&["build", "--features", "metrics", "-p", SERVER_PACKAGE]],
    ) {
        return false;
    }

    let Some(port) = reserve_port() else {
        eprintln!("failed to reserve a free TCP port");
        return false;
    };
    let bind_addr = format!("127.0.0.1:{port}");

    let mut child = match spawn_server(workspace_root, &bind_addr) {
        Ok(child) => child,
        Err(err) => {
            eprintln!("failed to launch {SERVER_PACKAGE}: {err}");
            return false;
        }
    };

    let result = match Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => {
            let base_url = format!("http://{bind_addr}");
            if !wait_for_health(&client, &format!("{base_url}/health"), Duration::from_secs(60)) {
                eprintln!("server did not answer /health within timeout");
                false
            } else {
                match chat_round_trip(&client, &base_url) {
                    Ok(()) => verify_metrics(&client, &format!("{base_url}/metrics")),
                    Err(err) => {
                        eprintln!("chat round trip failed: {err}");
                        false
                    }
                }
            }
        }
        Err(err) => {
            eprintln!("failed to build HTTP client: {err}");
            false
        }
    };

    if let Err(err) = child.kill() {
        if err.kind() != std::io::ErrorKind::InvalidInput {
            eprintln!("failed to terminate server process: {err}");
        }
    }
    let _ = child.wait();

    if result {
        println!("smoke test passed");
    }
    result
}

fn spawn_server(workspace_root: &Path, bind_addr: &str) -> std::io::Result<Child> {
    Command::new("cargo")
        .args([
            "run",
            "--quiet",
            "--features",
            "metrics",
            "-p",
            SERVER_PACKAGE,
            "--",
            "--bind-addr",
            bind_addr,
            "--metrics-enabled",
            "true",
        ])
        .env("RUST_LOG", "warn")
        .current_dir(workspace_root)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
}

#[derive(Deserialize)]
struct AuthBody {
    user: UserBody,
    access_token: String,
}

#[derive(Deserialize)]
struct UserBody {
    id: String,
}

#[derive(Deserialize)]
struct IdBody {
    id: String,
}

/// Register two users, open their conversation and post one message to it.
fn chat_round_trip(client: &Client, base_url: &str) -> Result<(), String> {
    let suffix = std::process::id();
    let alice = register(client, base_url, &format!("smoke_a{suffix}"))?;
    let bob = register(client, base_url, &format!("smoke_b{suffix}"))?;

    let response = client
        .post(format!("{base_url}/api/conversations"))
        .bearer_auth(&alice.access_token)
        .json(&json!({ "other_user_id": bob.user.id }))
        .send()
        .map_err(|err| err.to_string())?;
    expect_status(response.status(), StatusCode::OK, "open conversation")?;
    let conversation: IdBody = response.json().map_err(|err| err.to_string())?;

    let response = client
        .post(format!(
            "{base_url}/api/conversations/{}/messages",
            conversation.id
        ))
        .bearer_auth(&alice.access_token)
        .json(&json!({ "content": "smoke" }))
        .send()
        .map_err(|err| err.to_string())?;
    expect_status(response.status(), StatusCode::CREATED, "send message")?;

    let response = client
        .get(format!(
            "{base_url}/api/conversations/{}/messages",
            conversation.id
        ))
        .bearer_auth(&bob.access_token)
        .send()
        .map_err(|err| err.to_string())?;
    expect_status(response.status(), StatusCode::OK, "read history")?;
    let history: Vec<serde_json::Value> = response.json().map_err(|err| err.to_string())?;
    if history.len() != 1 {
        return Err(format!("expected one message in history, found {}", history.len()));
    }
    Ok(())
}

fn register(client: &Client, base_url: &str, username: &str) -> Result<AuthBody, String> {
    let response = client
        .post(format!("{base_url}/api/auth/register"))
        .json(&json!({
            "username": username,
            "email": format!("{username}@smoke.test"),
            "password": SMOKE_PASSWORD,
        }))
        .send()
        .map_err(|err| err.to_string())?;
    expect_status(response.status(), StatusCode::CREATED, "register")?;
    response.json().map_err(|err| err.to_string())
}

fn expect_status(actual: StatusCode, expected: StatusCode, step: &str) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("{step}: expected {expected}, got {actual}"))
    }
}

fn reserve_port() -> Option<u16> {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .ok()
}

fn wait_for_health(client: &Client, url: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match client.get(url).send() {
            Ok(response) if response.status().is_success() => return true,
            Ok(_) | Err(_) => sleep(Duration::from_millis(500)),
        }
    }
    false
}

fn verify_metrics(client: &Client, url: &str) -> bool {
    let body = match client.get(url).send() {
        Ok(response) if response.status() == StatusCode::OK => match response.text() {
            Ok(body) => body,
            Err(err) => {
                eprintln!("failed to read metrics body: {err}");
                return false;
            }
        },
        Ok(response) => {
            eprintln!("unexpected metrics response status: {}", response.status());
            return false;
        }
        Err(err) => {
            eprintln!("failed to call metrics endpoint: {err}");
            return false;
        }
    };

    let expected = [
        "parley_http_requests_total{route=\"/api/auth/register\",status=\"201\"} 2",
        "parley_http_requests_total{route=\"/api/conversations/{conversation_id}/messages\",status=\"201\"} 1",
        "parley_ws_sessions 0",
    ];
    let missing: Vec<&str> = expected
        .into_iter()
        .filter(|line| !body.contains(line))
        .collect();
    if missing.is_empty() {
        true
    } else {
        eprintln!("metrics endpoint is missing expected samples: {missing:?}");
        false
    }
}

fn run_commands(workspace_root: &Path, commands: &[&[&str]]) -> bool {
    for args in commands {
        let status = Command::new("cargo")
            .args(*args)
            .current_dir(workspace_root)
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                eprintln!("command 'cargo {}' failed with {status}", args.join(" "));
                return false;
            }
            Err(err) => {
                eprintln!("failed to spawn 'cargo': {err}");
                return false;
            }
        }
    }
    true
}

//! `fleetd` CLI — command-line client for the fleetd control plane.
//!
//! A standalone HTTP client that communicates with `fleetd-server`.
//! No internal crate dependencies — talks exclusively via the REST API.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";

const BANNER_SMALL: &str = "⬢ fleetd";

/// fleetd — deploy and supervise applications across a device fleet.
#[derive(Parser)]
#[command(
    name = "fleetd",
    version,
    about = "fleetd CLI — deploy, stop, and inspect applications on a device",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         FLEETD_ADDR   Server address (default: http://127.0.0.1:7700)\n\n\
         {DIM}Examples:{RESET}\n  \
         fleetd list\n  \
         fleetd deploy --app-id web-1 --app-name web --app-version 1.2.0 --artifact run.sh=https://artifacts.example/run.sh\n  \
         fleetd stop web-1"
    )
)]
struct Cli {
    /// fleetd server address.
    #[arg(long, env = "FLEETD_ADDR", default_value = "http://127.0.0.1:7700")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy an application version.
    Deploy {
        #[arg(long)]
        app_id: String,
        #[arg(long)]
        app_name: String,
        #[arg(long)]
        app_version: String,
        /// Artifact as `name=url`, repeatable. The extension (`.tar.gz`/`.zip` vs.
        /// anything else) decides whether it is treated as an archive or a script.
        #[arg(long = "artifact", value_parser = parse_artifact)]
        artifacts: Vec<(String, String)>,
    },
    /// Stop a running application.
    Stop {
        app_id: String,
        /// Graceful shutdown budget in seconds.
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
    /// Show the status of one application.
    Status { app_id: String },
}

fn parse_artifact(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=').map(|(name, url)| (name.to_owned(), url.to_owned())).ok_or_else(|| "expected name=url".to_owned())
}

struct Client {
    http: reqwest::Client,
    addr: String,
}

impl Client {
    fn new(addr: String) -> Self {
        Self { http: reqwest::Client::new(), addr }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.addr.trim_end_matches('/'))
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self.http.get(self.url(path)).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self.http.post(self.url(path)).json(body).send().await.context("request failed")?;
        handle_response(resp).await
    }
}

async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let body = resp.text().await.context("failed to read response body")?;
    if !status.is_success() {
        bail!("server returned {status}: {body}");
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).context("failed to parse response JSON")
}

fn artifact_type_for(name: &str) -> &'static str {
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".zip") {
        "archive"
    } else {
        "script"
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client = Client::new(cli.addr);

    match run(&client, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{RED}{BOLD}error:{RESET} {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Deploy { app_id, app_name, app_version, artifacts } => cmd_deploy(client, &app_id, &app_name, &app_version, &artifacts).await,
        Commands::Stop { app_id, timeout_secs } => cmd_stop(client, &app_id, timeout_secs).await,
        Commands::Status { app_id } => cmd_status(client, &app_id).await,
    }
}

async fn cmd_deploy(client: &Client, app_id: &str, app_name: &str, app_version: &str, artifacts: &[(String, String)]) -> Result<()> {
    if artifacts.is_empty() {
        bail!("at least one --artifact name=url is required");
    }

    let artifacts: Vec<Value> = artifacts
        .iter()
        .map(|(name, url)| {
            serde_json::json!({
                "name": name,
                "artifact_type": artifact_type_for(name),
                "storage_url": url,
                "checksums": {},
                "size": 0,
            })
        })
        .collect();

    let body = serde_json::json!({
        "app_id": app_id,
        "app_name": app_name,
        "app_version": app_version,
        "artifacts": artifacts,
    });

    println!("{CYAN}{BANNER_SMALL}{RESET} deploying {BOLD}{app_id}{RESET} ({app_version})...");
    let resp = client.post("/deploy", &body).await?;
    println!("{GREEN}✓{RESET} {resp}");
    Ok(())
}

async fn cmd_stop(client: &Client, app_id: &str, timeout_secs: u64) -> Result<()> {
    let body = serde_json::json!({ "timeout_secs": timeout_secs });
    client.post(&format!("/apps/{app_id}/stop"), &body).await?;
    println!("{GREEN}✓{RESET} stopped {app_id}");
    Ok(())
}

async fn cmd_status(client: &Client, app_id: &str) -> Result<()> {
    let resp = client.get(&format!("/apps/{app_id}")).await?;
    println!("{resp}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_artifact_splits_on_first_equals() {
        assert_eq!(parse_artifact("run.sh=https://x/run.sh").unwrap(), ("run.sh".to_owned(), "https://x/run.sh".to_owned()));
    }

    #[test]
    fn parse_artifact_rejects_missing_equals() {
        assert!(parse_artifact("run.sh").is_err());
    }

    #[test]
    fn artifact_type_detects_archives() {
        assert_eq!(artifact_type_for("bundle.tar.gz"), "archive");
        assert_eq!(artifact_type_for("bundle.zip"), "archive");
        assert_eq!(artifact_type_for("run.sh"), "script");
    }
}

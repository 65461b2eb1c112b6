//! A thin client for the daemon's façade: talks to an in-process `Manager`
//! by default, or over HTTP when `--endpoint` is given.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use serde::Serialize;
use serde_json::Value;
use silo::archive::FilenameArchive;
use silo::context::Context;
use silo::manager::{Engine, Manager, PoolItem};
use tabled::Tabled;

#[derive(Parser)]
#[command(name = "siloctl", about = "Control client for the silo repository daemon")]
struct Cli {
    /// Talk to a running daemon over HTTP instead of opening the KV stores
    /// directly. Example: `http://localhost:7420`.
    #[arg(long, env = "SILO_ENDPOINT")]
    endpoint: Option<String>,

    /// Bearer token, used only with `--endpoint`.
    #[arg(long, env = "SILO_API_TOKEN")]
    token: Option<String>,

    /// Base directory, used only without `--endpoint`.
    #[arg(long, env = "SILO_BASE_DIR")]
    base_dir: Option<std::path::PathBuf>,

    /// Print the raw JSON envelope instead of a table.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(subcommand)]
    Repo(RepoCommand),
    #[command(subcommand)]
    Pool(PoolCommand),
    #[command(subcommand)]
    Trim(TrimCommand),
    /// Import one or more package files into a repository.
    Import { repo_id: String, paths: Vec<String> },
    /// Produce deltas for every package in a repository.
    Delta { repo_id: String },
    /// Re-publish a repository's index.
    Index { repo_id: String },
    /// Clone a repository.
    Clone {
        repo_id: String,
        clone_name: String,
        #[arg(long)]
        copy_all: bool,
    },
    /// Pull entries from another repository.
    Pull { repo_id: String, source_id: String },
    /// Daemon status: uptime, version, job queues.
    Status,
}

#[derive(Subcommand)]
enum RepoCommand {
    Create { id: String },
    Remove { id: String },
    List,
}

#[derive(Subcommand)]
enum PoolCommand {
    List,
}

#[derive(Subcommand)]
enum TrimCommand {
    Packages {
        repo_id: String,
        max_packages: usize,
    },
    Obsoletes {
        repo_id: String,
    },
}

#[tokio::main]
async fn main() {
    color_eyre::install().expect("failed to install color-eyre");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match &cli.endpoint {
        Some(endpoint) => run_remote(endpoint, &cli).await,
        None => run_local(&cli),
    };

    if let Err(err) = result {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn open_manager(cli: &Cli) -> Result<Manager> {
    let Some(base_dir) = cli.base_dir.clone() else {
        return Err(eyre!("--base-dir (or SILO_BASE_DIR) is required without --endpoint"));
    };
    let ctx = Context::new(base_dir);
    let engine = Engine::open(ctx, Arc::new(FilenameArchive::default()))?;
    Ok(Manager::new(engine))
}

fn run_local(cli: &Cli) -> Result<()> {
    let manager = open_manager(cli)?;
    match &cli.command {
        Command::Repo(RepoCommand::Create { id }) => print_queued(cli, manager.create_repo(id)?),
        Command::Repo(RepoCommand::Remove { id }) => print_queued(cli, manager.delete_repo(id)?),
        Command::Repo(RepoCommand::List) => print_repos(cli, manager.list_repos()?),
        Command::Pool(PoolCommand::List) => print_pool(cli, manager.list_pool()?),
        Command::Import { repo_id, paths } => print_queued(cli, manager.bulk_add(repo_id, paths.clone())?),
        Command::Delta { repo_id } => print_queued(cli, manager.delta_repo(repo_id)?),
        Command::Index { repo_id } => print_queued(cli, manager.index_repo(repo_id)?),
        Command::Clone {
            repo_id,
            clone_name,
            copy_all,
        } => print_queued(cli, manager.clone_repo(repo_id, clone_name, *copy_all)?),
        Command::Pull { repo_id, source_id } => print_queued(cli, manager.pull_repo(repo_id, source_id)?),
        Command::Trim(TrimCommand::Packages { repo_id, max_packages }) => {
            print_queued(cli, manager.trim_packages(repo_id, *max_packages)?)
        }
        Command::Trim(TrimCommand::Obsoletes { repo_id }) => print_queued(cli, manager.trim_obsolete(repo_id)?),
        Command::Status => print_status(cli, manager.status()?),
    }
    Ok(())
}

async fn run_remote(endpoint: &str, cli: &Cli) -> Result<()> {
    let client = reqwest::Client::new();
    let (method, path, body) = request_for(&cli.command);

    let url = format!("{}/api/v1{}", endpoint.trim_end_matches('/'), path);
    let mut req = client.request(method, url);
    if let Some(token) = &cli.token {
        req = req.bearer_auth(token);
    }
    if let Some(body) = body {
        req = req.json(&body);
    }

    let response = req.send().await?;
    let status = response.status();
    let value: Value = response.json().await?;
    if cli.json || !status.is_success() {
        println!("{}", serde_json::to_string_pretty(&value)?);
        if !status.is_success() {
            std::process::exit(1);
        }
        return Ok(());
    }
    render_remote(&cli.command, &value);
    Ok(())
}

fn request_for(command: &Command) -> (reqwest::Method, String, Option<Value>) {
    use reqwest::Method;
    match command {
        Command::Repo(RepoCommand::Create { id }) => (Method::GET, format!("/create/repo/{id}"), None),
        Command::Repo(RepoCommand::Remove { id }) => (Method::GET, format!("/remove/repo/{id}"), None),
        Command::Repo(RepoCommand::List) => (Method::GET, "/list/repos".to_string(), None),
        Command::Pool(PoolCommand::List) => (Method::GET, "/list/pool".to_string(), None),
        Command::Import { repo_id, paths } => (
            Method::POST,
            format!("/import/{repo_id}"),
            Some(serde_json::json!({ "path": paths })),
        ),
        Command::Delta { repo_id } => (Method::GET, format!("/delta/repo/{repo_id}"), None),
        Command::Index { repo_id } => (Method::GET, format!("/index/repo/{repo_id}"), None),
        Command::Clone {
            repo_id,
            clone_name,
            copy_all,
        } => (
            Method::POST,
            format!("/clone/{repo_id}"),
            Some(serde_json::json!({ "cloneName": clone_name, "copyAll": copy_all })),
        ),
        Command::Pull { repo_id, source_id } => (
            Method::POST,
            format!("/pull/{repo_id}"),
            Some(serde_json::json!({ "source": source_id })),
        ),
        Command::Trim(TrimCommand::Packages { repo_id, max_packages }) => (
            Method::POST,
            format!("/trim/packages/{repo_id}"),
            Some(serde_json::json!({ "maxPackages": max_packages })),
        ),
        Command::Trim(TrimCommand::Obsoletes { repo_id }) => {
            (Method::GET, format!("/trim/obsoletes/{repo_id}"), None)
        }
        Command::Status => (Method::GET, "/status".to_string(), None),
    }
}

fn render_remote(command: &Command, value: &Value) {
    match command {
        Command::Repo(RepoCommand::List) => {
            let repos: Vec<String> = value
                .get("repos")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            print_table(repos.into_iter().map(|id| RepoRow { id }).collect());
        }
        Command::Pool(PoolCommand::List) => {
            let pool: Vec<PoolItem> = value
                .get("pool")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            print_table(pool.into_iter().map(PoolRow::from).collect());
        }
        _ => println!("{}", serde_json::to_string_pretty(value).unwrap_or_default()),
    }
}

#[derive(Tabled)]
struct RepoRow {
    id: String,
}

#[derive(Tabled)]
struct PoolRow {
    id: String,
    #[tabled(rename = "ref count")]
    ref_count: u64,
}

impl From<PoolItem> for PoolRow {
    fn from(item: PoolItem) -> Self {
        Self {
            id: item.id,
            ref_count: item.ref_count,
        }
    }
}

fn print_table<T: Tabled>(rows: Vec<T>) {
    println!("{}", tabled::Table::new(rows));
}

fn print_repos(cli: &Cli, repos: Vec<String>) {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&repos).unwrap_or_default());
        return;
    }
    print_table(repos.into_iter().map(|id| RepoRow { id }).collect());
}

fn print_pool(cli: &Cli, pool: Vec<PoolItem>) {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&json_pool(&pool)).unwrap_or_default());
        return;
    }
    print_table(pool.into_iter().map(PoolRow::from).collect());
}

fn json_pool(pool: &[PoolItem]) -> Value {
    serde_json::to_value(
        pool.iter()
            .map(|item| serde_json::json!({"id": item.id, "refCount": item.ref_count}))
            .collect::<Vec<_>>(),
    )
    .unwrap_or(Value::Null)
}

fn print_queued(cli: &Cli, key: Vec<u8>) {
    let job_id = hex::encode(key);
    if cli.json {
        println!("{}", serde_json::json!({ "queued": true, "jobId": job_id }));
    } else {
        println!("queued job {job_id}");
    }
}

#[derive(Serialize)]
struct StatusSummary {
    #[serde(rename = "uptimeSeconds")]
    uptime_seconds: i64,
    version: &'static str,
    active: usize,
    completed: usize,
    failed: usize,
}

fn print_status(cli: &Cli, status: silo::manager::Status) {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
        return;
    }
    let summary = StatusSummary {
        uptime_seconds: status.uptime_seconds,
        version: status.version,
        active: status.active.len(),
        completed: status.completed.len(),
        failed: status.failed.len(),
    };
    println!(
        "uptime: {}s  version: {}  active: {}  completed: {}  failed: {}",
        summary.uptime_seconds, summary.version, summary.active, summary.completed, summary.failed
    );
}

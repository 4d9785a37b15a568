use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "lifeline-cli")]
#[command(about = "Operator CLI for a running lifeline service", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Service banner (name and version)
    Status,
    /// Detailed health report
    Health,
    /// Readiness probe
    Readiness,
    /// Liveness probe
    Liveness,
    /// Hand the listener over to a fresh generation (SIGHUP)
    Upgrade(Target),
    /// Terminate the running generation gracefully (SIGTERM)
    Stop(Target),
}

#[derive(clap::Args)]
struct Target {
    /// Process id of the running generation
    #[arg(long, conflicts_with = "pid_file")]
    pid: Option<i32>,

    /// Pid file written by the running generation
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Status => probe(&client, &cli.url, "/").await?,
        Commands::Health => probe(&client, &cli.url, "/health").await?,
        Commands::Readiness => probe(&client, &cli.url, "/readiness").await?,
        Commands::Liveness => probe(&client, &cli.url, "/liveness").await?,
        Commands::Upgrade(target) => send_signal(&target, libc::SIGHUP, "SIGHUP")?,
        Commands::Stop(target) => send_signal(&target, libc::SIGTERM, "SIGTERM")?,
    }

    Ok(())
}

async fn probe(client: &reqwest::Client, base: &str, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let res = client
        .get(format!("{}{}", base.trim_end_matches('/'), path))
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let generation = res
        .headers()
        .get("x-lifeline-generation")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let text = res.text().await?;
    println!("HTTP {}", status);
    if let Some(generation) = generation {
        println!("generation: {}", generation);
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }

    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn resolve_pid(target: &Target) -> Result<i32, Box<dyn std::error::Error>> {
    if let Some(pid) = target.pid {
        return Ok(pid);
    }
    let path = target
        .pid_file
        .as_ref()
        .ok_or("either --pid or --pid-file is required")?;
    let content = std::fs::read_to_string(path)?;
    Ok(content.trim().parse()?)
}

fn send_signal(target: &Target, signal: libc::c_int, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let pid = resolve_pid(target)?;
    if pid <= 0 {
        return Err(format!("refusing to signal pid {}", pid).into());
    }
    // SAFETY: kill has no memory-safety preconditions; pid was checked to be positive.
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    println!("sent {} to {}", name, pid);
    Ok(())
}

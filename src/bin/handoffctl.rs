use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use graceful_handoff::config::ReloadSignal;

#[derive(Parser)]
#[command(name = "handoffctl")]
#[command(about = "Control a running graceful-handoff process", long_about = None)]
struct Cli {
    /// Process id of the running generation.
    #[arg(short, long, conflicts_with = "pid_file")]
    pid: Option<i32>,

    /// File holding the process id (see `lifecycle.pid_file`).
    #[arg(long)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain in-flight requests and exit (SIGTERM)
    Stop,
    /// Hand the listener to a new generation
    Reload {
        /// Reload signal the server was configured with
        #[arg(short, long, value_enum, default_value = "usr2")]
        signal: SignalArg,
    },
    /// Ask the serving generation who it is
    Status {
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum SignalArg {
    Usr2,
    Usr1,
    Hup,
}

impl From<SignalArg> for ReloadSignal {
    fn from(arg: SignalArg) -> Self {
        match arg {
            SignalArg::Usr2 => ReloadSignal::Usr2,
            SignalArg::Usr1 => ReloadSignal::Usr1,
            SignalArg::Hup => ReloadSignal::Hup,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Stop => {
            let pid = resolve_pid(&cli.pid, &cli.pid_file)?;
            send(pid, libc::SIGTERM)?;
            println!("Sent SIGTERM to {}", pid);
        }
        Commands::Reload { signal } => {
            let pid = resolve_pid(&cli.pid, &cli.pid_file)?;
            let signal = ReloadSignal::from(signal);
            send(pid, signal.as_raw())?;
            println!("Sent {} to {}", signal.name(), pid);
        }
        Commands::Status { url } => {
            let res = reqwest::Client::new()
                .get(format!("{}/pid", url.trim_end_matches('/')))
                .send()
                .await?;
            print_response(res).await?;
        }
    }

    Ok(())
}

fn resolve_pid(
    pid: &Option<i32>,
    pid_file: &Option<PathBuf>,
) -> Result<i32, Box<dyn std::error::Error>> {
    match (pid, pid_file) {
        (Some(pid), _) => Ok(*pid),
        (None, Some(path)) => {
            let content = std::fs::read_to_string(path)?;
            Ok(content.trim().parse()?)
        }
        (None, None) => Err("either --pid or --pid-file is required".into()),
    }
}

fn send(pid: i32, signal: i32) -> std::io::Result<()> {
    if pid <= 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ));
    }
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: server returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

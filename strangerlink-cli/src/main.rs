use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strangerlink_core::config::Config;
use strangerlink_core::core_rendezvous::MemoryNetwork;
use strangerlink_core::core_safety::BlocklistClassifier;
use strangerlink_core::core_session::{
    NullMediaSource, Participant, SessionDeps, SessionEvent, SessionHandle, SessionStatus,
};
use strangerlink_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use strangerlink_core::metrics::init_metrics;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "strangerlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file; environment variables still apply on top
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pair simulated clients over an in-process network
    Simulate {
        /// Number of clients
        #[arg(long, default_value_t = 4)]
        clients: usize,

        /// Interests handed out to clients round-robin (repeatable)
        #[arg(long = "interest")]
        interests: Vec<String>,

        /// Messages each client sends per partner
        #[arg(long, default_value_t = 2)]
        messages: usize,

        /// Partners each client meets before exiting
        #[arg(long, default_value_t = 1)]
        partners: usize,

        /// Matching rounds per search before a client gives up
        #[arg(long)]
        rounds: Option<u32>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env().context("loading config from environment")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = &args.log_level {
        log_config.level = level.parse::<LogLevel>().unwrap_or_else(|e| {
            eprintln!("{}, using 'info'", e);
            LogLevel::Info
        });
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    init_metrics();

    match args.command {
        Command::Simulate {
            clients,
            interests,
            messages,
            partners,
            rounds,
            timeout,
        } => {
            let mut config = config;
            if rounds.is_some() {
                config.matching.max_rounds = rounds;
            }
            config.validate()?;
            let plan = SimulationPlan {
                clients,
                interests,
                messages,
                partners: partners.max(1),
                timeout: Duration::from_secs(timeout),
            };
            let reports = simulate(&config, plan).await?;
            print_reports(&reports);
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

struct SimulationPlan {
    clients: usize,
    interests: Vec<String>,
    messages: usize,
    partners: usize,
    timeout: Duration,
}

#[derive(Debug, Default)]
struct ClientReport {
    name: String,
    interests: Vec<String>,
    partners: Vec<String>,
    sent: usize,
    received: usize,
    finished: bool,
}

async fn simulate(config: &Config, plan: SimulationPlan) -> Result<Vec<ClientReport>> {
    let network = Arc::new(MemoryNetwork::new());
    let classifier = Arc::new(BlocklistClassifier::new(&config.safety.blocklist));
    info!(clients = plan.clients, partners = plan.partners, "starting simulation");

    let mut tasks = Vec::with_capacity(plan.clients);
    for i in 0..plan.clients {
        let interests = if plan.interests.is_empty() {
            Vec::new()
        } else {
            vec![plan.interests[i % plan.interests.len()].clone()]
        };
        let participant = Participant::anonymous(interests);
        let deps = SessionDeps::new(network.clone(), classifier.clone(), Arc::new(NullMediaSource));
        let (handle, events, _task) = SessionHandle::spawn(config, deps);

        let messages = plan.messages;
        let partners = plan.partners;
        let limit = plan.timeout;
        tasks.push(tokio::spawn(async move {
            let mut report = ClientReport {
                name: participant.display_name.clone(),
                interests: participant.interests.clone(),
                ..ClientReport::default()
            };
            let outcome = tokio::time::timeout(
                limit,
                run_client(&handle, events, participant, messages, partners, &mut report),
            )
            .await;
            match outcome {
                Ok(Ok(())) => report.finished = true,
                Ok(Err(e)) => warn!(client = %report.name, error = %e, "client failed"),
                Err(_) => warn!(client = %report.name, "client timed out"),
            }
            let _ = handle.exit().await;
            report
        }));
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for task in tasks {
        reports.push(task.await.context("simulated client panicked")?);
    }
    Ok(reports)
}

async fn run_client(
    handle: &SessionHandle,
    mut events: mpsc::Receiver<SessionEvent>,
    participant: Participant,
    messages: usize,
    partners: usize,
    report: &mut ClientReport,
) -> Result<()> {
    let local_id = participant.local_id.clone();
    let mut in_session = false;
    handle.start_search(participant.clone()).await?;

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StatusChanged {
                status: SessionStatus::Connected,
                peer: Some(peer),
            } => {
                info!(client = %report.name, partner = %peer.display_name, "paired");
                in_session = true;
                report.partners.push(peer.display_name);
                for n in 1..=messages {
                    let text = format!("message {} from {}", n, report.name);
                    if handle.send_text(text).await.is_ok() {
                        report.sent += 1;
                    }
                }
                // Leave the partner a moment to answer
                tokio::time::sleep(Duration::from_millis(250)).await;
                if report.partners.len() >= partners {
                    drain_received(&mut events, &local_id, report);
                    return Ok(());
                }
                in_session = false;
                handle.skip().await?;
            }
            SessionEvent::StatusChanged {
                status: SessionStatus::Disconnected,
                ..
            } => {
                if report.partners.len() >= partners {
                    return Ok(());
                }
                if !in_session {
                    bail!("no partner found");
                }
                in_session = false;
                debug!(client = %report.name, "partner left, searching again");
                handle.start_search(participant.clone()).await?;
            }
            SessionEvent::MessageAppended(message)
                if !message.is_system() && message.sender_id != local_id =>
            {
                report.received += 1;
            }
            _ => {}
        }
    }
    Ok(())
}

fn drain_received(events: &mut mpsc::Receiver<SessionEvent>, local_id: &str, report: &mut ClientReport) {
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::MessageAppended(message) = event {
            if !message.is_system() && message.sender_id != local_id {
                report.received += 1;
            }
        }
    }
}

fn print_reports(reports: &[ClientReport]) {
    println!(
        "{:<12} {:<16} {:>4} {:>4} {:>6}  partners",
        "client", "interests", "sent", "recv", "done"
    );
    for report in reports {
        println!(
            "{:<12} {:<16} {:>4} {:>4} {:>6}  {}",
            report.name,
            report.interests.join(","),
            report.sent,
            report.received,
            if report.finished { "yes" } else { "no" },
            report.partners.join(", ")
        );
    }
    let finished = reports.iter().filter(|r| r.finished).count();
    println!("{}/{} clients finished", finished, reports.len());
}

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webpilot_agent::Session;
use webpilot_core::{AgentEvent, Config, EventSink};
use webpilot_gateway::{AutomationGateway, ToolExecutor};

#[derive(Parser)]
#[command(name = "webpilot", version, about = "Chat-driven browser automation agent")]
struct Cli {
    /// Path to the JSON config file (default: ~/.webpilot/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat session (the default)
    Chat,
    /// Start the automation process and list the tools it advertises
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => chat(config).await,
        Command::Tools => tools(config).await,
    }
}

async fn tools(config: Config) -> anyhow::Result<()> {
    let gateway = Arc::new(AutomationGateway::new(config.gateway));
    gateway.initialize().await?;
    for tool in gateway.list_tools() {
        println!("{:<24} {}", tool.name, tool.description.unwrap_or_default());
    }
    gateway.shutdown().await;
    Ok(())
}

async fn chat(config: Config) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(256);
    let session = Arc::new(Session::connect(config, EventSink::new(tx)).await?);

    // Render progress events without ever blocking the agent loop
    let drain = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::ToolStarted { tool, .. } => println!("  > {}", tool),
                AgentEvent::ToolSucceeded {
                    tool,
                    duration_ms,
                    change_percent,
                    ..
                } => match change_percent {
                    Some(p) => println!("  + {} ({} ms, {:.1}% changed)", tool, duration_ms, p),
                    None => println!("  + {} ({} ms)", tool, duration_ms),
                },
                AgentEvent::ToolFailed { tool, error, .. } => {
                    println!("  ! {}: {}", tool, error)
                }
                AgentEvent::AssistantMessage { text } => println!("{}", text),
                AgentEvent::FrameCaptured { .. } => {}
            }
        }
    });

    println!(
        "webpilot ready ({}). Type a task, or /help for commands.",
        session.provider_name()
    );

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/help" => {
                println!("/log      show the action log");
                println!("/script   print the replay script");
                println!("/status   connection state and recording counters");
                println!("/provider active model provider");
                println!("/clear    clear history and action log");
                println!("/quit     exit (Ctrl-C during a run cancels it)");
            }
            "/log" => {
                for entry in session.action_log() {
                    println!(
                        "{} {:<12} {} {}",
                        entry.timestamp.format("%H:%M:%S"),
                        entry.tool_name,
                        if entry.success { "ok" } else { "FAILED" },
                        entry.arguments
                    );
                }
                for v in session.validations() {
                    println!(
                        "{} validation  {:?} {}",
                        v.timestamp.format("%H:%M:%S"),
                        v.result,
                        v.description
                    );
                }
            }
            "/script" => println!("{}", session.replay_script()),
            "/clear" => {
                session.clear_history().await;
                session.clear_action_log();
                println!("History and action log cleared.");
            }
            "/provider" => println!("{}", session.provider_name()),
            "/status" => {
                println!("connection: {:?}", session.connection_state());
                println!("{}", serde_json::to_string_pretty(&session.playbook_status())?);
            }
            _ => {
                let run = session.process_message(line);
                tokio::pin!(run);
                loop {
                    tokio::select! {
                        result = &mut run => {
                            match result {
                                // The answer itself arrives through the event
                                // stream as assistant narration
                                Ok(_) => println!(),
                                Err(e) => eprintln!("run failed: {}", e),
                            }
                            break;
                        }
                        _ = tokio::signal::ctrl_c() => {
                            info!("Ctrl-C received, cancelling run");
                            session.cancel_execution();
                        }
                    }
                }
            }
        }
    }

    session.shutdown().await;
    drain.abort();
    Ok(())
}

#![forbid(unsafe_code)]

//! `conduit-ctl`: command-line caller for `conduit-host`.
//!
//! Launches the configured host, waits for its ready announcement, issues
//! one request and prints the result as JSON. `chat` streams the agent's
//! reply as it arrives.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::client::{ChatUpdate, HostClient};
use agent_conduit::config::GlobalConfig;
use agent_conduit::protocol::types::{InvokeAgentBody, InvokeToolBody, InvokeTriggerBody};
use agent_conduit::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "conduit-ctl",
    about = "Drive a conduit agent host from the command line",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host command line, overriding the configuration and environment.
    #[arg(long)]
    host_command: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the host is responsive.
    Ping,

    /// Show host name, version and counts.
    Info,

    /// List agents.
    Agents,

    /// List toolkits with their tools.
    Toolkits,

    /// List every tool.
    Tools,

    /// List triggers.
    Triggers,

    /// List models referenced by agents.
    Models,

    /// List agent system prompts.
    Prompts,

    /// Invoke a tool directly.
    Tool {
        /// Tool name.
        tool: String,
        /// Toolkit to search; all toolkits when omitted.
        #[arg(long)]
        toolkit: Option<String>,
        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Send a prompt to an agent and stream the reply.
    Chat {
        /// Agent name.
        agent: String,
        /// Prompt text.
        prompt: String,
        /// Continue an existing thread.
        #[arg(long)]
        thread: Option<String>,
    },

    /// Fire a trigger and print the collected result.
    Trigger {
        /// Agent name.
        agent: String,
        /// Trigger name.
        trigger: String,
        /// Expected trigger type.
        #[arg(long, default_value = "")]
        trigger_type: String,
        /// Continue an existing thread.
        #[arg(long)]
        thread: Option<String>,
    },

    /// Ask the host to shut down.
    Shutdown,
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(args)) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load(args.config.as_deref())?;
    if let Some(command) = args.host_command {
        config.client.host_command = command;
    }

    let client = HostClient::from_config(&config.client)?;
    client.wait_ready().await?;

    let is_shutdown = matches!(args.command, Command::Shutdown);
    let outcome = execute(&client, args.command).await;
    if !is_shutdown {
        client.stop().await?;
    }
    outcome
}

async fn execute(client: &HostClient, command: Command) -> Result<()> {
    match command {
        Command::Ping => print_json(&client.ping().await?),
        Command::Info => print_json(&client.app_info().await?),
        Command::Agents => print_json(&client.list_agents().await?),
        Command::Toolkits => print_json(&client.list_toolkits().await?),
        Command::Tools => print_json(&client.list_tools().await?),
        Command::Triggers => print_json(&client.list_triggers().await?),
        Command::Models => print_json(&client.list_models().await?),
        Command::Prompts => print_json(&client.list_prompts().await?),
        Command::Tool {
            tool,
            toolkit,
            args,
        } => {
            let args = serde_json::from_str(&args)
                .map_err(|err| AppError::InvalidParams(format!("--args is not JSON: {err}")))?;
            let body = InvokeToolBody {
                tool,
                toolkit,
                args,
            };
            print_json(&client.invoke_tool(&body).await?)
        }
        Command::Chat {
            agent,
            prompt,
            thread,
        } => {
            let body = InvokeAgentBody {
                agent,
                prompt,
                thread_id: thread,
                attachments: Vec::new(),
            };
            chat(client, &body).await
        }
        Command::Trigger {
            agent,
            trigger,
            trigger_type,
            thread,
        } => {
            let body = InvokeTriggerBody {
                agent_name: agent,
                trigger_name: trigger,
                trigger_type,
                thread_id: thread,
                http_request: None,
            };
            print_json(&client.invoke_trigger(&body, &CancellationToken::new()).await?)
        }
        Command::Shutdown => print_json(&client.shutdown().await?),
    }
}

/// Print text as it streams, then the thread id on its own line.
async fn chat(client: &HostClient, body: &InvokeAgentBody) -> Result<()> {
    let mut stream = client.invoke_agent(body).await?;
    let mut printed = 0;
    let mut stdout = std::io::stdout();

    while let Some(update) = stream.next().await {
        match update? {
            ChatUpdate::TextUpdated { text, .. } => {
                if let Some(fresh) = text.get(printed..) {
                    print!("{fresh}");
                    printed = text.len();
                }
            }
            ChatUpdate::MessageSealed { text, .. } => {
                println!("{}", text.get(printed..).unwrap_or_default());
                printed = 0;
            }
            ChatUpdate::ToolCall(call) => {
                println!("[tool call] {} {}", call.name, call.arguments);
            }
            ChatUpdate::ToolCallsCompleted(results) => {
                for result in results {
                    println!("[tool result] {}: {}", result.call_id, result.output);
                }
            }
            ChatUpdate::Completed { thread_id } => {
                if let Some(thread_id) = thread_id {
                    println!("thread: {thread_id}");
                }
            }
            ChatUpdate::ResponseRequested(_)
            | ChatUpdate::Status(_)
            | ChatUpdate::Unrecognised { .. } => {}
        }
        stdout.flush()?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

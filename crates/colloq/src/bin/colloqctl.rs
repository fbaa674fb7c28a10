//! colloqctl: talk to a conversation service from the terminal.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};
use tokio::sync::Notify;

use colloq::config::{self, ClientConfig};
use colloq::protocol::mime;
use colloq::{
    ConversationClient, MessageWithContentPartArgs, StartExchangeArgs, StartSessionArgs,
    StaticTokenProvider,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    cli.common.init_logging();

    match cli.command {
        Command::Send(cmd) => async_send(cli.common, cmd),
        Command::Listen(cmd) => async_listen(cli.common, cmd),
        Command::Config { command } => handle_config(&cli.common, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Colloq - real-time conversation protocol client.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Bearer token (overrides access_token from the config)
    #[arg(long, env = "COLLOQ_ACCESS_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

impl CommonOpts {
    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.quiet {
            log::set_max_level(LevelFilter::Off);
            return;
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("colloq={level},colloqctl={level}")));

        if self.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(io::stderr().is_terminal()))
                .try_init()
                .ok();
        }

        // The library logs through the log facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.trace {
            LevelFilter::Trace
        } else if self.debug {
            LevelFilter::Debug
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn load_config(&self) -> Result<ClientConfig> {
        ClientConfig::load(self.config.as_deref())
    }

    fn client(&self, config: &ClientConfig) -> Result<ConversationClient> {
        let token = self
            .token
            .clone()
            .or_else(|| config.access_token.clone())
            .ok_or_else(|| anyhow!("no access token: pass --token or set access_token"))?;
        let client =
            ConversationClient::from_config(config, Arc::new(StaticTokenProvider::new(token)));

        client.on_status_change(|status, error| match error {
            Some(error) => warn!("connection {status}: {error}"),
            None => info!("connection {status}"),
        });
        client.on_dispatch_error(|err| warn!("{err}"));
        Ok(client)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one user message and print the reply
    Send(SendCommand),
    /// Print every envelope received
    Listen(ListenCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct SendCommand {
    /// Conversation id (generated when omitted)
    #[arg(long)]
    conversation: Option<String>,
    /// Exchange id (generated when omitted)
    #[arg(long)]
    exchange: Option<String>,
    /// MIME type of the message
    #[arg(long, default_value = mime::TEXT_PLAIN)]
    mime_type: String,
    /// Seconds to wait for the reply
    #[arg(long, default_value_t = 120)]
    timeout: u64,
    /// Message text
    text: String,
}

#[derive(Debug, Args)]
struct ListenCommand {
    /// Only print envelopes of this conversation
    #[arg(long)]
    conversation: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration (token redacted)
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn async_send(common: CommonOpts, cmd: SendCommand) -> Result<()> {
    let config = common.load_config()?;
    let client = common.client(&config)?;

    let conversation_id = cmd
        .conversation
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let session = client
        .start_session(StartSessionArgs::new(conversation_id.clone()))
        .context("starting session")?;
    let exchange = session
        .start_exchange(StartExchangeArgs {
            exchange_id: cmd.exchange,
            properties: None,
        })
        .context("starting exchange")?;
    debug!(
        "conversation {conversation_id}, exchange {}",
        exchange.exchange_id()
    );

    let finished = Arc::new(Notify::new());
    let done = finished.clone();
    exchange.on_exchange_end(move || done.notify_one());
    exchange.on_message_start(|message| {
        message.on_content_part_start(|part| {
            part.on_chunk(|chunk| {
                print!("{}", chunk.data);
                let _ = io::stdout().flush();
            });
            part.on_completed(|completed| {
                println!();
                for citation in &completed.citations {
                    let titles: Vec<&str> =
                        citation.sources.iter().map(|s| s.title.as_str()).collect();
                    println!("  [{}] {}", citation.citation_id, titles.join("; "));
                }
            });
        });
        message.on_tool_call_start(|call| eprintln!("-> tool {}", call.tool_name));
    });

    exchange
        .send_message_with_content_part(
            MessageWithContentPartArgs::text(cmd.text).with_mime_type(cmd.mime_type),
        )
        .await
        .context("sending message")?;

    let waited = tokio::time::timeout(Duration::from_secs(cmd.timeout), finished.notified()).await;
    if waited.is_err() {
        warn!("no reply within {}s", cmd.timeout);
    }

    if !session.is_ended() {
        session.send_end().context("ending session")?;
    }
    session.flush().await.context("flushing")?;
    client.disconnect();

    if waited.is_err() {
        bail!("timed out waiting for the exchange to end");
    }
    Ok(())
}

#[tokio::main]
async fn async_listen(common: CommonOpts, cmd: ListenCommand) -> Result<()> {
    let config = common.load_config()?;
    let client = common.client(&config)?;

    let filter = cmd.conversation;
    client.dispatcher().on_any_event(move |envelope| {
        if filter
            .as_deref()
            .is_some_and(|id| id != envelope.conversation_id)
        {
            return;
        }
        match serde_json::to_string(envelope) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!("cannot print envelope: {err}"),
        }
    });
    client
        .dispatcher()
        .on_unhandled_error_start(|error| eprintln!("unhandled: {error}"));

    client.connected().await.context("connecting")?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    client.disconnect();
    Ok(())
}

fn handle_config(common: &CommonOpts, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = common.load_config()?;
            print!("{}", config.to_toml_redacted()?);
        }
        ConfigCommand::Path => {
            let path = match common.config.as_deref() {
                Some(path) => config::expand_path(path)?,
                None => config::default_config_path()?,
            };
            println!("{}", path.display());
        }
    }
    Ok(())
}

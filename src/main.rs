//! resplink - command-line client for RESP servers
//!
//! Provides both a REPL and one-shot command execution.

mod output;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use resplink_client::{Client, ClientConfig, Listener, PubSubMessage, ReplyValue};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "resplink")]
#[command(about = "Pipelined command-line client for RESP2/RESP3 servers")]
#[command(version)]
struct Cli {
    /// Server address (host:port)
    #[arg(short, long, env = "RESPLINK_ADDR")]
    server: Option<String>,

    /// Protocol version (2 or 3)
    #[arg(short, long, env = "RESPLINK_PROTOCOL")]
    protocol: Option<u8>,

    /// ACL username
    #[arg(long, env = "RESPLINK_USERNAME")]
    user: Option<String>,

    /// Password
    #[arg(long, env = "RESPLINK_PASSWORD")]
    password: Option<String>,

    /// Database to select
    #[arg(long, env = "RESPLINK_DATABASE")]
    db: Option<u32>,

    /// YAML config file
    #[arg(short, long, env = "RESPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Print replies as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive REPL
    Repl,

    /// Run one command and print its reply
    Exec {
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Subscribe to channels and print messages until Ctrl+C
    Subscribe {
        #[arg(required = true)]
        channels: Vec<String>,
    },

    /// Subscribe to patterns and print messages until Ctrl+C
    Psubscribe {
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Run commands separated by ';' inside MULTI/EXEC
    Multi {
        /// e.g. "SET a 1; INCR a"
        script: String,
    },
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };
        if let Some(server) = &self.server {
            config.addr = server.clone();
        }
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(password) = &self.password {
            config = config.with_auth(self.user.clone(), password.clone());
        }
        if let Some(db) = self.db {
            config.database = db;
        }
        config.client_name.get_or_insert_with(|| "resplink".to_string());
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.client_config()?;
    let addr = config.addr.clone();
    tracing::debug!("connecting to {} (RESP{})", addr, config.protocol);

    let client = Client::connect(config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(&client, &addr, cli.json).await?;
        }
        Some(Commands::Exec { args }) => {
            let result = client.send(&args).await;
            let failed = print_reply(result, cli.json);
            client.close().await?;
            if failed {
                std::process::exit(1);
            }
        }
        Some(Commands::Subscribe { channels }) => {
            let names: Vec<&str> = channels.iter().map(String::as_str).collect();
            client.subscribe(&names, printer(cli.json)).await?;
            wait_for_interrupt(&client).await?;
        }
        Some(Commands::Psubscribe { patterns }) => {
            let names: Vec<&str> = patterns.iter().map(String::as_str).collect();
            client.psubscribe(&names, printer(cli.json)).await?;
            wait_for_interrupt(&client).await?;
        }
        Some(Commands::Multi { script }) => {
            let mut transaction = client.multi();
            for line in script.split(';') {
                let args = repl::split_args(line)?;
                if !args.is_empty() {
                    transaction.add(&args);
                }
            }
            let result = client.exec(transaction).await.map(ReplyValue::Array);
            let failed = print_reply(result, cli.json);
            client.close().await?;
            if failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Prints a reply or error. Returns whether it was an error.
fn print_reply(result: Result<ReplyValue, resplink_client::ClientError>, json: bool) -> bool {
    match result {
        Ok(value) => {
            if json {
                println!("{}", output::to_json(&value));
            } else {
                println!("{}", output::render(&value));
            }
            value.is_error()
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            true
        }
    }
}

fn printer(json: bool) -> Listener {
    Listener::text(move |message: &PubSubMessage<String>| {
        if json {
            let value = serde_json::json!({
                "channel": message.channel,
                "pattern": message.pattern,
                "payload": message.payload,
            });
            println!("{}", value);
        } else {
            match &message.pattern {
                Some(pattern) => println!(
                    "{} {} {}",
                    pattern.dimmed(),
                    message.channel.cyan(),
                    message.payload
                ),
                None => println!("{} {}", message.channel.cyan(), message.payload),
            }
        }
    })
}

async fn wait_for_interrupt(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());
    let mut events = client.queue_events();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => eprintln!("{}: {:?}", "Warning".yellow(), event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".dimmed());
                break;
            }
        }
    }
    client.destroy();
    Ok(())
}

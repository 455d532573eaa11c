use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use agentlink::{
    config::Config,
    constants::{full_version, DEFAULT_APP_NAME},
    events::{emit_system_event, init_events_from_config, LogLevel},
    handler_fn, Client, Server, Task, TaskType,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "agentlink mutually-authenticated TLS transport")]
struct Args {
    /// Optional path to config file (TOML)
    #[arg(short, long, default_value = "agentlink.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo every message back to its sender
    Serve {
        /// Listen address, overrides server.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Connect, send one message and print the reply
    Send {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 5)]
        wait: u64,
        message: String,
    },
}

fn echo_task(task: Task) -> anyhow::Result<()> {
    let peer = task.connection().peer_addr();
    match task.kind() {
        TaskType::Connect => println!("connected: {}", peer),
        TaskType::Disconnect => println!("disconnected: {}", peer),
        TaskType::Data => {
            let payload = task.payload().unwrap_or_default();
            task.connection()
                .send(payload, false)
                .with_context(|| format!("echo to {}", peer))?;
        }
        _ => {}
    }
    Ok(())
}

fn serve(mut config: Config, bind: Option<String>) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.server.get_or_insert_with(Default::default).bind = bind;
    }
    let server = Server::from_config(&config, None, handler_fn(echo_task))?;
    let addr = server.start()?;
    println!("{} {} listening on {}", DEFAULT_APP_NAME, full_version(), addr);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    rt.block_on(tokio::signal::ctrl_c())
        .context("failed to wait for ctrl-c")?;
    println!("shutting down");
    server.stop();
    Ok(())
}

fn send(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
    wait: u64,
    message: String,
) -> anyhow::Result<()> {
    let client_cfg = config.client.get_or_insert_with(Default::default);
    if let Some(host) = host {
        client_cfg.host = host;
    }
    if let Some(port) = port {
        client_cfg.port = port;
    }
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let tx = Arc::new(parking_lot::Mutex::new(tx));
    let factory = handler_fn(move |task: Task| {
        if task.kind() == TaskType::Data {
            if let Some(payload) = task.into_payload() {
                let _ = tx.lock().send(payload);
            }
        }
        Ok(())
    });
    let client = Client::from_config(&config, None, factory)?;
    client.start().context("connection failed")?;
    client.send(message.as_bytes(), false)?;
    let reply = rx
        .recv_timeout(Duration::from_secs(wait))
        .context("no reply before timeout")?;
    println!("{}", String::from_utf8_lossy(&reply));
    client.stop();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load_or_default(&args.config)?;

    // Initialize events AFTER config is loaded so custom logging path can be applied
    init_events_from_config(config.logging.as_ref());
    emit_system_event(
        "main",
        LogLevel::Info,
        "startup",
        Some(format!("{} config={}", full_version(), args.config)),
    );

    match args.command {
        Command::Serve { bind } => serve(config, bind),
        Command::Send {
            host,
            port,
            wait,
            message,
        } => send(config, host, port, wait, message),
    }
}

//! adminbus-stat - statistics and admin client for adminbus servers.
//!
//! # Usage
//!
//! ```bash
//! # Server header as JSON
//! adminbus-stat --product httpd header
//!
//! # Cluster-wide process view, then one child
//! adminbus-stat --product httpd process
//! adminbus-stat --product httpd process --pid 4242
//!
//! # XML dump restricted to thread and JVM sections
//! adminbus-stat --product httpd xml --query 'thread=0&jvm=0'
//!
//! # Reload configuration in every child and follow the notices
//! adminbus-stat --product httpd reconfigure
//! adminbus-stat --product httpd watch --count 1
//! ```

use std::path::PathBuf;
use std::time::Duration;

use adminbus::admin::{peer_reconfigure, peer_reopen_logs, request_restart};
use adminbus::stats::types::INVALID_PROCESS_ID;
use adminbus::{AdminConfig, ClientOptions, NoticeReceiver, StatsClient};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

/// Query statistics and send admin commands to an adminbus server.
#[derive(Parser, Debug)]
#[command(name = "adminbus-stat")]
#[command(version)]
struct Args {
    /// Product name the server's socket is named after
    #[arg(short, long)]
    product: String,

    /// Directory holding the server socket
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Seconds to wait for each reply
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Print compact JSON
    #[arg(long)]
    compact: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Server header
    Header,
    /// Pids of the running children
    Pids,
    /// Process statistics; cluster-wide without --pid
    Process {
        #[arg(long)]
        pid: Option<i32>,
    },
    /// Thread slots of one child
    Threads {
        #[arg(long)]
        pid: i32,
    },
    /// Virtual servers, or one of them
    Vs { id: Option<String> },
    /// Web modules, or one of them
    Webmodules { name: Option<String> },
    /// Servlets of a web module
    Servlets { web_module: String },
    /// JDBC connection pools of one child
    Jdbc {
        #[arg(long)]
        pid: i32,
    },
    /// JVM statistics of one child
    Jvm {
        #[arg(long)]
        pid: i32,
    },
    /// Session replication statistics
    Sessrepl,
    /// XML statistics dump
    Xml {
        /// Section selector, e.g. `thread=0&jvm=0`
        #[arg(long, default_value = "")]
        query: String,
    },
    /// Plain-text performance dump
    Perfdump,
    /// Reload configuration in every child
    Reconfigure,
    /// Reopen log files in every child
    ReopenLogs,
    /// Terminate the children so the supervisor restarts them
    Restart,
    /// Print server notices as they arrive
    Watch {
        /// Stop after this many notices
        #[arg(long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    adminbus::init_tracing();
    let args = Args::parse();

    let mut config = AdminConfig::from_env(args.product.clone())
        .with_reply_timeout(Duration::from_secs(args.timeout));
    if let Some(dir) = &args.temp_dir {
        config = config.with_temp_dir(dir);
    }
    tracing::debug!(socket = %config.socket_path().display(), "Using admin socket");

    run(&args, &config).await
}

async fn run(args: &Args, config: &AdminConfig) -> anyhow::Result<()> {
    let options = ClientOptions::from_config(config);
    match &args.command {
        Command::Reconfigure => {
            peer_reconfigure(config).await.context("reconfigure failed")?;
            println!("reconfigure done");
            return Ok(());
        }
        Command::ReopenLogs => {
            peer_reopen_logs(config).await.context("reopen logs failed")?;
            println!("logs reopened");
            return Ok(());
        }
        Command::Restart => {
            request_restart(config).await.context("restart failed")?;
            println!("restart requested");
            return Ok(());
        }
        Command::Watch { count } => return watch(&options, *count, args.compact).await,
        _ => {}
    }

    let mut client = StatsClient::connect(options)
        .await
        .with_context(|| format!("cannot reach {}", config.socket_path().display()))?;

    match &args.command {
        Command::Header => {
            let header = client.header().cloned().context("server sent no header")?;
            print(&header, args.compact)
        }
        Command::Pids => print(&client.pids().await?, args.compact),
        Command::Process { pid } => {
            let info = client.process(pid.unwrap_or(INVALID_PROCESS_ID)).await?;
            print(&info, args.compact)
        }
        Command::Threads { pid } => {
            let mut threads = Vec::new();
            for index in client.thread_indices(*pid).await? {
                threads.push(client.thread(*pid, index).await?);
            }
            print(&threads, args.compact)
        }
        Command::Vs { id: Some(id) } => print(&client.virtual_server(id).await?, args.compact),
        Command::Vs { id: None } => print(&client.virtual_servers().await?, args.compact),
        Command::Webmodules { name: Some(name) } => {
            print(&client.web_module(name).await?, args.compact)
        }
        Command::Webmodules { name: None } => print(&client.web_modules().await?, args.compact),
        Command::Servlets { web_module } => {
            print(&client.servlets(web_module).await?, args.compact)
        }
        Command::Jdbc { pid } => print(&client.jdbc_pools(*pid).await?, args.compact),
        Command::Jvm { pid } => print(&client.jvm(*pid).await?, args.compact),
        Command::Sessrepl => print(&client.session_replication().await?, args.compact),
        Command::Xml { query } => {
            println!("{}", client.xml(query).await?);
            Ok(())
        }
        Command::Perfdump => {
            println!("{}", client.perf_dump().await?);
            Ok(())
        }
        Command::Reconfigure | Command::ReopenLogs | Command::Restart | Command::Watch { .. } => {
            unreachable!("handled before connecting")
        }
    }
}

async fn watch(options: &ClientOptions, count: Option<usize>, compact: bool) -> anyhow::Result<()> {
    let mut receiver = NoticeReceiver::subscribe(options)
        .await
        .context("cannot subscribe to notices")?;
    let mut seen = 0;
    while count.is_none_or(|limit| seen < limit) {
        let notice = receiver.next().await?;
        print(&notice, compact)?;
        seen += 1;
    }
    Ok(())
}

fn print<T: Serialize>(value: &T, compact: bool) -> anyhow::Result<()> {
    let text = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{}", text);
    Ok(())
}

// src/main.rs
//! Paddock daemon and admin CLI entry point.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use paddock::cluster;
use paddock::server::{run_server, DaemonConfig, State};
use std::io::{BufRead, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};

/// Default REST API port
const DEFAULT_PORT: u16 = 8443;

#[derive(Parser)]
#[command(name = "paddockd")]
#[command(version)]
#[command(about = "Clustered manager for Linux system containers and virtual machines", long_about = None)]
struct Cli {
    /// State directory
    #[arg(long, default_value = "/var/lib/paddock", global = true)]
    var_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Daemon {
        /// Address to bind the REST API to
        #[arg(long, default_value = "0.0.0.0:8443")]
        bind: String,
    },

    /// Low-level administration commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Low-level cluster administration commands
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Print the addresses of the cluster members serving the database
    ListDatabase,

    /// Show cluster configuration as YAML
    Show,

    /// Edit cluster configuration as YAML
    Edit,

    /// Recover a cluster whose quorum has been lost
    RecoverFromQuorumLoss {
        /// Don't require user confirmation
        #[arg(short, long)]
        quiet: bool,
    },

    /// Remove a raft node from the raft configuration
    RemoveRaftNode {
        /// Address of the member to remove
        address: String,

        /// Don't require user confirmation
        #[arg(short, long)]
        quiet: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { bind } => run_daemon(cli.var_dir, &bind),
        Commands::Admin { command } => match command {
            AdminCommands::Cluster { command } => run_cluster_command(cli.var_dir, command),
        },
    }
}

fn run_daemon(var_dir: PathBuf, bind: &str) -> Result<()> {
    let bind_addr = bind.parse().context("Invalid bind address")?;
    let config = DaemonConfig {
        var_dir: var_dir.clone(),
        bind_addr,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let state = State::new(config)?;
        write_pid_file(&var_dir)?;

        let result = run_server(state).await;

        let _ = std::fs::remove_file(pid_file(&var_dir));
        result.map_err(anyhow::Error::from)
    })
}

fn pid_file(var_dir: &Path) -> PathBuf {
    var_dir.join("paddockd.pid")
}

fn write_pid_file(var_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(var_dir)?;
    std::fs::write(pid_file(var_dir), std::process::id().to_string())?;
    Ok(())
}

/// Whether a daemon is running against this state directory
fn daemon_running(var_dir: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(pid_file(var_dir)) else {
        return false;
    };
    let Ok(pid) = raw.trim().parse::<u32>() else {
        return false;
    };
    Path::new(&format!("/proc/{}", pid)).exists()
}

fn run_cluster_command(var_dir: PathBuf, command: ClusterCommands) -> Result<()> {
    match command {
        ClusterCommands::ListDatabase => cmd_list_database(&var_dir),
        ClusterCommands::Show => cmd_show(&var_dir),
        ClusterCommands::Edit => cmd_edit(&var_dir),
        ClusterCommands::RecoverFromQuorumLoss { quiet } => {
            cmd_recover_from_quorum_loss(&var_dir, quiet)
        }
        ClusterCommands::RemoveRaftNode { address, quiet } => {
            cmd_remove_raft_node(&var_dir, &address, quiet)
        }
    }
}

fn open_local_db(var_dir: &Path) -> Result<rusqlite::Connection> {
    let path = var_dir.join("database").join(paddock::db::LOCAL_DB);
    paddock::db::init_local(path)
        .context("Failed to open local database")
        .map_err(Into::into)
}

fn cmd_list_database(var_dir: &Path) -> Result<()> {
    let conn = open_local_db(var_dir)?;
    let addresses =
        cluster::list_database_nodes(&conn).context("Failed to get database nodes")?;

    println!("ADDRESS");
    for address in addresses {
        println!("{}", address);
    }

    Ok(())
}

fn cmd_show(var_dir: &Path) -> Result<()> {
    let conn = open_local_db(var_dir)?;
    let members = cluster::get_raft_nodes(&conn)?;

    let segment = cluster::latest_segment_id(&var_dir.join("database"));
    print!("{}", cluster::render_config(&members, &segment)?);

    Ok(())
}

fn cmd_edit(var_dir: &Path) -> Result<()> {
    if daemon_running(var_dir) {
        bail!("The daemon is running, please stop it first.");
    }

    let mut conn = open_local_db(var_dir)?;
    let members = cluster::get_raft_nodes(&conn)?;

    let address = paddock::db::node_config_get(&conn, "cluster.https_address")?;
    if address.unwrap_or_default().is_empty() {
        bail!(
            "Can't edit cluster configuration as server isn't clustered (missing \"cluster.https_address\" config)"
        );
    }

    let segment = cluster::latest_segment_id(&var_dir.join("database"));
    let rendered = cluster::render_config(&members, &segment)?;

    // Non-interactive input comes from stdin wholesale.
    let mut content = if std::io::stdin().is_terminal() {
        cluster::editor::spawn_editor(rendered.as_bytes())?
    } else {
        let mut buffer = Vec::new();
        std::io::stdin().read_to_end(&mut buffer)?;
        buffer
    };

    loop {
        let outcome = String::from_utf8(content.clone())
            .map_err(|e| paddock::Error::Validation(format!("Invalid UTF-8: {}", e)))
            .and_then(|text| cluster::parse_config(&text))
            .and_then(|new_members| {
                cluster::validate_new_config(&members, &new_members)?;
                cluster::reconfigure(&mut conn, &new_members)
            });

        match outcome {
            Ok(()) => return Ok(()),
            Err(err) => {
                eprintln!("Config validation error: {}", err);
                println!("Press enter to open the editor again or ctrl+c to abort change");
                let mut discard = [0u8; 1];
                std::io::stdin().read_exact(&mut discard)?;

                content = cluster::editor::spawn_editor(&content)?;
            }
        }
    }
}

fn cmd_recover_from_quorum_loss(var_dir: &Path, quiet: bool) -> Result<()> {
    if daemon_running(var_dir) {
        bail!("The daemon is running, please stop it first.");
    }

    if !quiet {
        confirm(
            "You should run this command only if you are *absolutely* certain that this is\n\
             the only database node left in your cluster AND that other database nodes will\n\
             never come back (i.e. their daemon won't ever be started again).\n\
             \n\
             This will make this server the only member of the cluster, and it won't\n\
             be possible to perform operations on former cluster members anymore.\n\
             \n\
             However all information about former cluster members will be preserved in the\n\
             database, so you can possibly inspect it for further recovery.\n\
             \n\
             Do you want to proceed? (yes/no): ",
        )
        .context("Recover operation aborted")?;
    }

    let mut conn = open_local_db(var_dir)?;
    cluster::recover_from_quorum_loss(&mut conn)?;

    println!("Cluster recovered; this server is now the only voter.");
    Ok(())
}

fn cmd_remove_raft_node(var_dir: &Path, address: &str, quiet: bool) -> Result<()> {
    let address = cluster::canonical_address(address, DEFAULT_PORT);

    if !quiet {
        confirm(
            "You should run this command only if you ended up in an\n\
             inconsistent state where a node has been uncleanly removed (i.e. it doesn't show\n\
             up in the cluster member list but it's still in the raft configuration).\n\
             \n\
             Do you want to proceed? (yes/no): ",
        )
        .context("Remove raft node operation aborted")?;
    }

    // This is the one admin command that talks to the running daemon.
    if !daemon_running(var_dir) {
        bail!("Failed to connect to daemon: not running");
    }

    let client = reqwest::blocking::Client::new();
    let response = client
        .delete(format!(
            "http://127.0.0.1:{}/internal/cluster/raft-node/{}",
            DEFAULT_PORT, address
        ))
        .send()
        .context("Failed to connect to daemon")?;

    if !response.status().is_success() {
        let body: serde_json::Value = response.json().unwrap_or_default();
        bail!(
            "Failed to remove raft node: {}",
            body.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error")
        );
    }

    Ok(())
}

/// Interactive yes/no confirmation; anything but `yes` aborts
fn confirm(prompt: &str) -> Result<()> {
    print!("{}", prompt);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;

    if input.trim().eq_ignore_ascii_case("yes") {
        Ok(())
    } else {
        bail!("aborted by user")
    }
}

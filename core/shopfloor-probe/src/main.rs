//! shopfloor-probe: CLI client for the shopfloor daemon.
//!
//! Forwards telemetry reports from collector scripts to the daemon and
//! exposes the daemon's read surface for shell use.
//!
//! ## Subcommands
//!
//! - `report`: forward one telemetry report (reads JSON from stdin)
//! - `cursor`: mark an operation as currently viewed
//! - `status`, `jobs`, `activity`, `cursors`, `health`: print daemon state
//! - `watch`: stream cursor broadcasts as they happen

mod daemon_client;
mod logging;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "shopfloor-probe")]
#[command(about = "Shopfloor machine-state client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward a telemetry report to the daemon (reads JSON from stdin)
    Report,

    /// Mark an operation as currently viewed
    Cursor {
        /// Operation identifier
        #[arg(value_name = "OPERATION_ID")]
        operation_id: String,

        /// Human-readable operation name
        #[arg(long)]
        name: Option<String>,
    },

    /// Print the live machine status snapshot
    Status,

    /// Print all jobs
    Jobs,

    /// Print per-day activity totals
    Activity {
        /// Restrict to one machine
        #[arg(long)]
        machine_id: Option<String>,
    },

    /// Print the cursor cache
    Cursors,

    /// Check daemon health
    Health,

    /// Stream cursor broadcasts until interrupted
    Watch,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Report => daemon_client::send_report_from_stdin(),
        Commands::Cursor {
            operation_id,
            name,
        } => daemon_client::send_cursor_seen(&operation_id, name.as_deref()),
        Commands::Status => daemon_client::print_query(shopfloor_protocol::Method::GetStatus, None),
        Commands::Jobs => daemon_client::print_query(shopfloor_protocol::Method::GetJobs, None),
        Commands::Activity { machine_id } => {
            let params = machine_id
                .map(|machine_id| serde_json::json!({ "machine_id": machine_id }));
            daemon_client::print_query(shopfloor_protocol::Method::GetDayActivity, params)
        }
        Commands::Cursors => {
            daemon_client::print_query(shopfloor_protocol::Method::GetCursors, None)
        }
        Commands::Health => daemon_client::print_query(shopfloor_protocol::Method::GetHealth, None),
        Commands::Watch => daemon_client::watch_broadcasts(),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "shopfloor-probe command failed");
        eprintln!("{err}");
        std::process::exit(1);
    }
}

// ABOUTME: Command-line interface definition for the fleetd binary.
// ABOUTME: One subcommand per registry operation plus audit inspection and the watch bridge.

use clap::{Parser, Subcommand};
use fleetd_core::Mode;

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Device fleet registry with automatic connection recovery")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered devices
    List {
        /// Only devices of this type
        #[arg(long = "type", value_name = "TYPE")]
        device_type: Option<String>,

        /// Only devices resolved for this mode
        #[arg(long)]
        mode: Option<Mode>,

        /// Only devices exposing this feature (can be repeated)
        #[arg(long = "feature", value_name = "NAME")]
        features: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Register a new device
    Add {
        id: String,
        #[arg(value_name = "TYPE")]
        device_type: String,
    },
    /// Remove a device, promoting another if it was the default
    Delete { id: String },
    /// Make a device the default
    Promote { id: String },
    /// Show or switch the global mode
    Mode {
        /// development or production
        mode: Option<Mode>,
    },
    /// Show the features a device type exposes in the current mode
    Features {
        #[arg(value_name = "TYPE")]
        device_type: String,
    },
    /// Show the pricing a device type has in the current mode
    Pricing {
        #[arg(value_name = "TYPE")]
        device_type: String,
    },
    /// Print the audit log
    Audit {
        /// Drop a torn trailing line before printing
        #[arg(long)]
        repair: bool,
    },
    /// Read JSON-lines device reports from stdin and drive recovery
    Watch,
}

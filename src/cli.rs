//! Command-line interface for hostprov
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// hostprov - host provisioning for virtual machine instances
#[derive(Parser)]
#[command(name = "hostprov")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "hostprov.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Print the private subnet for the configured bridge, allocating one if needed
    Subnet {
        /// Bridge to look up (defaults to network.bridge_name)
        #[arg(short, long)]
        bridge: Option<String>,
    },

    /// Create and activate a NetworkManager bridge for an ethernet interface
    Bridge {
        /// Physical interface to enslave (e.g., eth0)
        interface: String,
    },

    /// Grow an instance image
    Resize {
        /// Image file
        image: PathBuf,

        /// New size (e.g., 10G, 512M, 1073741824)
        size: String,
    },

    /// Convert a raw image to qcow2 if needed and print the resulting path
    Convert {
        /// Image file
        image: PathBuf,
    },

    /// Check that KVM can be used and is not held by another hypervisor
    Check,

    /// Print the host architecture as image catalogues name it
    Arch,

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "hostprov", &mut std::io::stdout());
    }
}

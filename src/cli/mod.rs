// src/cli/mod.rs
//! CLI definitions for the corral bundle engine
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations are in the `commands` module.
//!
//! - `detect` - Report installed state of a bundle and its packages
//! - `plan` - Show the actions a bundle action would take
//! - `apply` - Detect, plan, and apply a bundle action
//! - `eval` - Evaluate a condition expression
//! - `format` - Expand a `[Variable]` template

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "corral")]
#[command(version)]
#[command(about = "Installation bundle engine: detect, plan, and apply multi-package bundles", long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that opens a bundle
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Path to the bundle description (TOML)
    pub bundle: PathBuf,

    /// Engine configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the package cache directory
    #[arg(long)]
    pub cache_root: Option<PathBuf>,

    /// Set a string variable before detection (NAME=VALUE, repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Print machine-readable JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

/// Options for commands that plan
#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Bundle action: install, uninstall, repair, modify
    #[arg(short, long, default_value = "install")]
    pub action: String,

    /// Request a package state explicitly (PACKAGE=none|absent|present|repair, repeatable)
    #[arg(long = "request", value_name = "PACKAGE=STATE")]
    pub requests: Vec<String>,

    /// Request an MSI feature state (PACKAGE:FEATURE=absent|local, repeatable)
    #[arg(long = "feature", value_name = "PACKAGE:FEATURE=STATE")]
    pub features: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Detect the installed state of a bundle
    Detect {
        #[command(flatten)]
        session: SessionArgs,

        /// Also query the bundle's update feed
        #[arg(long)]
        check_updates: bool,
    },

    /// Plan a bundle action without applying it
    Plan {
        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Detect, plan, and apply a bundle action
    Apply {
        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        plan: PlanArgs,

        /// Interpreter used to run exe payloads (e.g. /bin/sh)
        #[arg(long)]
        launcher: Option<PathBuf>,

        /// Answer files-in-use reports with this many retries before aborting
        #[arg(long, default_value = "0")]
        files_in_use_retries: u32,

        /// Hide the progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Evaluate a condition expression
    Eval {
        /// Condition, e.g. `VersionNT >= v6.1 AND NOT Installed`
        condition: String,

        /// Set a string variable (NAME=VALUE, repeatable)
        #[arg(long = "set", value_name = "NAME=VALUE")]
        variables: Vec<String>,
    },

    /// Expand a template containing [Variable] tokens
    Format {
        /// Template, e.g. `/install /dir=[InstallFolder]`
        template: String,

        /// Set a string variable (NAME=VALUE, repeatable)
        #[arg(long = "set", value_name = "NAME=VALUE")]
        variables: Vec<String>,
    },
}

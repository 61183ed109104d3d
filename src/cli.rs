// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

use opal_config::AgentMode;

/// Opal — a steerable, tool-using coding-agent runtime.
#[derive(Parser, Debug)]
#[command(name = "opal", version, about, long_about = None)]
pub struct Cli {
    /// Path to a config file (default: discovered via the usual search path)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Working directory for the session (default: current directory)
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Agent mode: research | plan | agent
    #[arg(long, value_enum, global = true)]
    pub mode: Option<AgentMode>,

    /// Override the model, e.g. "anthropic/claude-opus-4-5" or a config key
    #[arg(long, short = 'm', global = true)]
    pub model: Option<String>,

    /// Resume a prior session from its JSONL file
    #[arg(long, global = true)]
    pub session: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Headless prompt text (reads stdin if omitted and stdin is not a TTY)
    pub prompt: Option<String>,
}

impl Cli {
    /// True when this invocation should run headlessly (one-shot or CI mode)
    /// rather than any interactive surface. The core never itself decides
    /// this — it is purely a front-end routing concern.
    pub fn is_headless(&self) -> bool {
        self.command.is_some() || self.prompt.is_some()
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the resolved configuration and exit
    ShowConfig,
    /// List known models from the static catalog
    ListModels {
        /// Only models for this provider
        #[arg(long)]
        provider: Option<String>,
    },
    /// Print shell completions for the given shell
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

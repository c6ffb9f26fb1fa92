// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::io;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use slog::info;

use pf::api::DebugLevel;
use pf::api::Limit;
use pf::api::RulesetClass;
use pf::api::Timeout;
use pf::print::print_altqs_into;
use pf::print::print_limits_into;
use pf::print::print_rules_into;
use pf::print::print_src_nodes_into;
use pf::print::print_states_into;
use pf::print::print_status_into;
use pf::print::print_timeouts_into;
use pfctl::PfCtl;
use pfctl::log::term_logger;
use pfctl::policy::Policy;

/// Load a packet filter policy into an engine and inspect the result.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The policy file to load. An empty policy is used when absent.
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// A state table, as written by `export-states`, to import once
    /// the policy is loaded.
    #[arg(long)]
    states: Option<PathBuf>,

    /// Enable the filter once the policy is loaded.
    #[arg(short = 'e', long)]
    enable: bool,

    /// Override the configured debug level.
    #[arg(short = 'x', long)]
    debug: Option<DebugLevel>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Parser)]
enum Command {
    /// Load the policy and report how many rules it holds.
    Check,

    /// Show the rules of one ruleset class of an anchor.
    ShowRules {
        #[arg(short, long, default_value = "")]
        anchor: String,

        #[arg(short, long, default_value = "filter")]
        class: RulesetClass,

        /// Include counters and skip steps.
        #[arg(short, long)]
        verbose: bool,
    },

    /// List the anchors directly beneath a path.
    ShowAnchors {
        #[arg(default_value = "")]
        path: String,
    },

    /// Show the state table.
    ShowStates,

    /// Show the source-tracking table.
    ShowSrcNodes,

    /// Show the filter status and counters.
    ShowStatus,

    /// Show every timeout value.
    ShowTimeouts,

    /// Show every pool limit.
    ShowLimits,

    /// Show the active queues.
    ShowAltqs,

    /// Print the synchronization digest of the main ruleset.
    Digest,

    /// Write the state table to stdout.
    ExportStates,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = term_logger();

    let policy = match &cli.file {
        Some(path) => Policy::from_file(path)?,
        None => Policy::default(),
    };

    let ctl = PfCtl::open(&policy, log.clone())?;
    let loaded = ctl.load(&policy)?;
    info!(log, "policy loaded"; "rules" => loaded);

    if let Some(level) = cli.debug {
        ctl.set_debug(level)?;
    }

    if let Some(path) = &cli.states {
        let text = std::fs::read_to_string(path)?;
        let added = ctl.import_states(&text)?;
        info!(log, "states imported"; "count" => added);
    }

    if cli.enable {
        ctl.start()?;
    }

    let mut out = io::stdout().lock();
    match cli.cmd {
        Command::Check => {
            writeln!(out, "{loaded} rules loaded")?;
        }

        Command::ShowRules { anchor, class, verbose } => {
            let rules = ctl.dump_rules(&anchor, class)?;
            print_rules_into(&mut out, class, &rules, verbose)?;
        }

        Command::ShowAnchors { path } => {
            for name in ctl.list_rulesets(&path)? {
                writeln!(out, "{name}")?;
            }
        }

        Command::ShowStates => {
            print_states_into(&mut out, &ctl.get_states(None)?.states)?;
        }

        Command::ShowSrcNodes => {
            print_src_nodes_into(&mut out, &ctl.get_src_nodes()?.nodes)?;
        }

        Command::ShowStatus => {
            print_status_into(&mut out, &ctl.status()?)?;
        }

        Command::ShowTimeouts => {
            let timeouts = Timeout::ALL
                .into_iter()
                .map(|t| Ok((t, ctl.get_timeout(t)?)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            print_timeouts_into(&mut out, &timeouts)?;
        }

        Command::ShowLimits => {
            let limits = Limit::ALL
                .into_iter()
                .map(|l| Ok((l, ctl.get_limit(l)?)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            print_limits_into(&mut out, &limits)?;
        }

        Command::ShowAltqs => {
            print_altqs_into(&mut out, &ctl.dump_altqs()?)?;
        }

        Command::Digest => {
            let digest = ctl.status()?.checksum;
            let hex: String =
                digest.iter().map(|b| format!("{b:02x}")).collect();
            writeln!(out, "{hex}")?;
        }

        Command::ExportStates => {
            write!(out, "{}", ctl.export_states()?)?;
        }
    }

    ctl.engine().shutdown();
    Ok(())
}

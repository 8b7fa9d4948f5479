//! CLI module - Command line interface definitions and handlers

mod commands;

pub use commands::{collect_inputs, read_document, run};

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::delivery::OutputFormat;

/// Docswarm - document processing swarm
///
/// Chunks documents, routes chunks to capability-matched workers, merges and
/// evaluates their results and delivers a report.
#[derive(Parser, Debug)]
#[command(name = "docswarm")]
#[command(version)]
#[command(about = "🐝 Chunk, route, evaluate and deliver documents", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbose output (debug logs)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run documents through the whole pipeline and deliver the reports
    Process(ProcessArgs),

    /// Show how a document is chunked
    Chunk(ChunkArgs),

    /// Rank the configured workers for a task description
    Route(RouteArgs),

    /// Manage the config file
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Parser)]
pub struct ProcessArgs {
    /// Files or directories to ingest
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Report format: json, csv, html, prose, text
    #[arg(long, short, default_value = "text")]
    pub format: OutputFormat,

    /// Where reports go
    #[arg(long, value_enum, default_value = "file")]
    pub channel: ChannelArg,

    /// Output directory for the file channel (default: from config)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Delivery strategy
    #[arg(long, value_enum, default_value = "immediate")]
    pub delivery: DeliveryArg,

    /// Delay for scheduled delivery (e.g. 30s, 5m)
    #[arg(long, default_value = "10s")]
    pub schedule_in: humantime::Duration,

    /// Processing goals handed to every strategy
    #[arg(long = "goal")]
    pub goals: Vec<String>,

    /// File extensions to include when walking directories (e.g. md,txt,pdf)
    #[arg(long, short = 'e', value_delimiter = ',')]
    pub extensions: Option<Vec<String>>,

    /// Skip hidden files and directories
    #[arg(long)]
    pub skip_hidden: bool,

    /// Output format for the run summary
    #[arg(long, value_enum, default_value = "human")]
    pub report: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChannelArg {
    /// One file per report in the output directory
    File,
    /// Print reports to stdout
    Console,
}

impl ChannelArg {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelArg::File => "file",
            ChannelArg::Console => "console",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeliveryArg {
    /// Send as soon as the report is ready
    Immediate,
    /// Send after --schedule-in
    Scheduled,
    /// Combine reports into batches
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Human-readable summary
    Human,
    /// JSON output
    Json,
}

#[derive(Debug, Clone, Parser)]
pub struct ChunkArgs {
    /// Document to chunk
    #[arg(required = true)]
    pub file: PathBuf,

    /// Print chunks as JSON
    #[arg(long)]
    pub json: bool,

    /// Override max words per chunk
    #[arg(long)]
    pub max_words: Option<usize>,

    /// Override overlap words
    #[arg(long)]
    pub overlap: Option<usize>,
}

#[derive(Debug, Clone, Parser)]
pub struct RouteArgs {
    /// Task description
    #[arg(required = true)]
    pub description: String,

    /// Required capability tags
    #[arg(long, short, value_delimiter = ',')]
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Write a commented sample config
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show,
    /// Print the config path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_process() {
        let cli = Cli::parse_from([
            "docswarm",
            "process",
            "notes.md",
            "--format",
            "html",
            "--delivery",
            "scheduled",
            "--schedule-in",
            "5m",
            "--goal",
            "risks",
            "--goal",
            "costs",
        ]);
        let Commands::Process(args) = cli.command else {
            panic!("expected process");
        };
        assert_eq!(args.format, OutputFormat::Html);
        assert_eq!(args.delivery, DeliveryArg::Scheduled);
        assert_eq!(*args.schedule_in, std::time::Duration::from_secs(300));
        assert_eq!(args.goals, vec!["risks", "costs"]);
        assert_eq!(args.channel, ChannelArg::File);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["docswarm", "config", "show", "--verbose", "--log-json"]);
        assert!(cli.verbose);
        assert!(cli.log_json);
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigArgs {
                action: ConfigAction::Show
            })
        ));
    }

    #[test]
    fn test_route_requirements_split() {
        let cli = Cli::parse_from(["docswarm", "route", "review rust code", "-r", "code,rust"]);
        let Commands::Route(args) = cli.command else {
            panic!("expected route");
        };
        assert_eq!(args.requirements, vec!["code", "rust"]);
    }
}

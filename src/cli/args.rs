//! CLI argument definitions using clap derive

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Strata - incremental container image stages from git content
///
/// Diagnostic commands over a local repository: resolve references and
/// produce the checksums, patches and archives that drive stage builds.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the commit HEAD points to
    Head(RepoArgs),

    /// List tags
    Tags(RepoArgs),

    /// List remote branches of origin
    Branches(RepoArgs),

    /// Checksum of the tracked paths at a commit
    Checksum(ChecksumArgs),

    /// Create (or reuse) the patch between two commits
    Patch(PatchArgs),

    /// Create (or reuse) the archive of a commit
    Archive(ArchiveArgs),

    /// Check whether two commits merge cleanly
    MergeCheck(MergeCheckArgs),
}

/// Repository selection
#[derive(Args, Debug, Clone)]
pub struct RepoArgs {
    /// Path inside the repository
    #[arg(short, long, default_value = ".")]
    pub repo: PathBuf,
}

/// Path selection shared by content commands
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Directory the include/exclude globs are relative to
    #[arg(long, default_value = "")]
    pub base_path: String,

    /// Include globs (comma-separated)
    #[arg(long = "include", value_delimiter = ',')]
    pub include_paths: Vec<String>,

    /// Exclude globs (comma-separated)
    #[arg(long = "exclude", value_delimiter = ',')]
    pub exclude_paths: Vec<String>,
}

/// Arguments for the checksum command
#[derive(Args, Debug)]
pub struct ChecksumArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Paths hashed into the digest (repeatable)
    #[arg(short, long = "path")]
    pub paths: Vec<String>,

    /// Commit, branch or tag (defaults to HEAD)
    #[arg(long)]
    pub commit: Option<String>,
}

/// Arguments for the patch command
#[derive(Args, Debug)]
pub struct PatchArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Commit, branch or tag the patch starts from
    #[arg(long)]
    pub from: String,

    /// Commit, branch or tag the patch leads to (defaults to HEAD)
    #[arg(long)]
    pub to: Option<String>,

    /// Include whole files as context
    #[arg(long)]
    pub entire_file_context: bool,

    /// Include binary deltas
    #[arg(long)]
    pub binary: bool,

    /// Copy the patch to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the archive command
#[derive(Args, Debug)]
pub struct ArchiveArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Commit, branch or tag (defaults to HEAD)
    #[arg(long)]
    pub commit: Option<String>,

    /// Copy the archive to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the merge-check command
#[derive(Args, Debug)]
pub struct MergeCheckArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    /// Commit, branch or tag to merge
    #[arg(long)]
    pub from: String,

    /// Commit, branch or tag to merge into
    #[arg(long)]
    pub to: String,
}

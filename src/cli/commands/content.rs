//! Content commands - checksum, patch, archive

use crate::cli::args::{ArchiveArgs, ChecksumArgs, PatchArgs};
use crate::cli::commands::{open_repo, path_filter, print_json, resolve_commit};
use crate::config::Config;
use crate::error::{StrataError, StrataResult};
use crate::git::{ArchiveOptions, ChecksumOptions, GitRepo, PatchOptions};
use console::style;
use serde_json::json;
use std::path::Path;

/// Execute the checksum command
pub async fn checksum(args: ChecksumArgs, config: &Config, json: bool) -> StrataResult<()> {
    let repo = open_repo(&args.repo, config)?;
    let commit = resolve_commit(&repo, args.commit.as_deref().unwrap_or("HEAD")).await?;

    let opts = ChecksumOptions {
        filter: path_filter(&args.filter),
        paths: args.paths,
        commit: commit.to_string(),
    };
    let checksum = repo.checksum(&opts).await?;

    if json {
        return print_json(&json!({
            "commit": commit,
            "digest": checksum.digest,
            "no_match_paths": checksum.no_match_paths,
        }));
    }

    println!("{}", checksum.digest);
    for path in &checksum.no_match_paths {
        eprintln!("{} {}", style("No match:").yellow(), path);
    }
    Ok(())
}

/// Execute the patch command
pub async fn patch(args: PatchArgs, config: &Config, json: bool) -> StrataResult<()> {
    let repo = open_repo(&args.repo, config)?;
    let from = resolve_commit(&repo, &args.from).await?;
    let to = resolve_commit(&repo, args.to.as_deref().unwrap_or("HEAD")).await?;

    let mut opts = PatchOptions::new(path_filter(&args.filter), from.as_str(), to.as_str());
    opts.with_entire_file_context = args.entire_file_context;
    opts.with_binary = args.binary;

    let patch = repo.create_patch(&opts).await?;
    if let Some(output) = &args.output {
        copy_out(patch.path(), output).await?;
    }

    if json {
        return print_json(&json!({
            "path": patch.path(),
            "descriptor": patch.descriptor(),
        }));
    }

    let descriptor = patch.descriptor();
    println!("{} {}", style("Patch:").bold(), patch.path().display());
    println!(
        "  {}..{}  {} path(s), {} binary, {} bytes",
        from.short(),
        to.short(),
        descriptor.paths.len(),
        descriptor.binary_paths.len(),
        descriptor.size
    );
    for path in &descriptor.paths {
        println!("  {}", path);
    }
    Ok(())
}

/// Execute the archive command
pub async fn archive(args: ArchiveArgs, config: &Config, json: bool) -> StrataResult<()> {
    let repo = open_repo(&args.repo, config)?;
    let commit = resolve_commit(&repo, args.commit.as_deref().unwrap_or("HEAD")).await?;

    let opts = ArchiveOptions {
        filter: path_filter(&args.filter),
        commit: commit.to_string(),
    };
    let archive = repo.create_archive(&opts).await?;
    if let Some(output) = &args.output {
        copy_out(archive.path(), output).await?;
    }

    if json {
        return print_json(&json!({
            "path": archive.path(),
            "descriptor": archive.descriptor(),
        }));
    }

    let descriptor = archive.descriptor();
    println!("{} {}", style("Archive:").bold(), archive.path().display());
    println!(
        "  {}  {} file(s), {} bytes",
        commit.short(),
        descriptor.file_count,
        descriptor.size
    );
    Ok(())
}

async fn copy_out(from: &Path, to: &Path) -> StrataResult<()> {
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| StrataError::io(format!("copying {} to {}", from.display(), to.display()), e))?;
    Ok(())
}

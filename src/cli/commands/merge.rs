//! Merge-check command - detached merge of two commits

use crate::cli::args::MergeCheckArgs;
use crate::cli::commands::{open_repo, print_json, resolve_commit};
use crate::config::Config;
use crate::error::StrataResult;
use crate::git::GitRepo;
use console::style;
use serde_json::json;

/// Execute the merge-check command
pub async fn execute(args: MergeCheckArgs, config: &Config, json: bool) -> StrataResult<()> {
    let repo = open_repo(&args.repo, config)?;
    let from = resolve_commit(&repo, &args.from).await?;
    let to = resolve_commit(&repo, &args.to).await?;

    let merge = repo
        .create_detached_merge_commit(from.as_str(), to.as_str())
        .await?;
    let parents = repo.merge_commit_parents(merge.as_str()).await?;

    if json {
        return print_json(&json!({ "merge": merge, "parents": parents }));
    }

    println!(
        "{} {} merges cleanly into {}",
        style("✓").green(),
        args.from,
        args.to
    );
    println!("{}", merge);
    Ok(())
}

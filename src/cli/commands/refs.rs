//! Reference commands - head, tags, branches

use crate::cli::args::RepoArgs;
use crate::cli::commands::{open_repo, print_json};
use crate::config::Config;
use crate::error::StrataResult;
use crate::git::GitRepo;
use serde_json::json;

/// Execute the head command
pub async fn head(args: RepoArgs, config: &Config, json: bool) -> StrataResult<()> {
    let repo = open_repo(&args, config)?;
    let commit = repo.head_commit().await?;

    if json {
        print_json(&json!({ "repo": repo.name(), "head": commit }))
    } else {
        println!("{}", commit);
        Ok(())
    }
}

/// Execute the tags command
pub async fn tags(args: RepoArgs, config: &Config, json: bool) -> StrataResult<()> {
    let repo = open_repo(&args, config)?;
    let mut tags = repo.tags_list().await?;
    tags.sort();
    print_list(&tags, json)
}

/// Execute the branches command
pub async fn branches(args: RepoArgs, config: &Config, json: bool) -> StrataResult<()> {
    let repo = open_repo(&args, config)?;
    let mut branches = repo.remote_branches_list().await?;
    branches.sort();
    print_list(&branches, json)
}

fn print_list(items: &[String], json: bool) -> StrataResult<()> {
    if json {
        return print_json(&items);
    }
    for item in items {
        println!("{}", item);
    }
    Ok(())
}

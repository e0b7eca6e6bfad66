//! CLI command implementations

pub mod content;
pub mod merge;
pub mod refs;

pub use content::{archive, checksum, patch};
pub use merge::execute as merge_check;
pub use refs::{branches, head, tags};

use crate::cli::args::{FilterArgs, RepoArgs};
use crate::config::Config;
use crate::context::EngineContext;
use crate::error::{StrataError, StrataResult};
use crate::git::{CommitId, GitRepo, LocalRepo, PathFilter};
use serde::Serialize;

/// Open the repository selected on the command line
pub(crate) fn open_repo(args: &RepoArgs, config: &Config) -> StrataResult<LocalRepo> {
    let ctx = EngineContext::new(config);
    let name = args
        .repo
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string();
    ctx.local_repo(&name, &args.repo)
}

/// Resolve a full commit id, `HEAD`, a full ref name, a branch or a tag
pub(crate) async fn resolve_commit(repo: &LocalRepo, reference: &str) -> StrataResult<CommitId> {
    if let Ok(commit) = CommitId::parse(reference) {
        return Ok(commit);
    }
    if reference == "HEAD" || reference.starts_with("refs/") {
        return repo.provider().resolve_reference(repo.handle(), reference).await;
    }
    if let Ok(commit) = repo.latest_branch_commit(reference).await {
        return Ok(commit);
    }
    repo.tag_commit(reference)
        .await
        .map_err(|_| StrataError::ReferenceNotFound {
            reference: reference.to_string(),
            reason: "no commit, branch or tag with this name".to_string(),
        })
}

pub(crate) fn path_filter(args: &FilterArgs) -> PathFilter {
    PathFilter {
        base_path: args.base_path.clone(),
        include_paths: args.include_paths.clone(),
        exclude_paths: args.exclude_paths.clone(),
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> StrataResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

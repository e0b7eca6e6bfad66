//! Integration tests for Strata

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use tempfile::TempDir;

/// Scratch repository driven through the git CLI
struct Repo {
    dir: TempDir,
}

impl Repo {
    fn new() -> Self {
        let repo = Self {
            dir: TempDir::new().unwrap(),
        };
        repo.git(&["init", "-q", "-b", "main"]);
        repo
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn git(&self, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(self.path())
            .env("GIT_AUTHOR_NAME", "Test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "Test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .env("GIT_AUTHOR_DATE", "2024-01-01T00:00:00Z")
            .env("GIT_COMMITTER_DATE", "2024-01-01T00:00:00Z")
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn write(&self, path: &str, content: &str) {
        let full = self.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    #[cfg(unix)]
    fn make_executable(&self, path: &str) {
        use std::os::unix::fs::PermissionsExt;
        let full = self.path().join(path);
        std::fs::set_permissions(full, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(not(unix))]
    fn make_executable(&self, _path: &str) {}

    fn remove(&self, path: &str) {
        std::fs::remove_file(self.path().join(path)).unwrap();
    }

    fn commit(&self, message: &str) -> String {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "--allow-empty", "-m", message]);
        self.git(&["rev-parse", "HEAD"])
    }
}

/// Config file pointing the cache at a scratch directory
fn scratch_config(dir: &Path) -> PathBuf {
    let config = dir.join("config.toml");
    let cache = dir.join("cache");
    std::fs::write(
        &config,
        format!("[cache]\nroot = {:?}\n", cache.display().to_string()),
    )
    .unwrap();
    config
}

mod cli_tests {
    use super::*;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn strata(scratch: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("strata");
        cmd.env("STRATA_CONFIG", scratch_config(scratch));
        cmd
    }

    #[test]
    fn help_displays() {
        let scratch = TempDir::new().unwrap();
        strata(scratch.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("incremental container image stages"));
    }

    #[test]
    fn version_displays() {
        let scratch = TempDir::new().unwrap();
        strata(scratch.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }

    #[test]
    fn head_prints_commit() {
        let scratch = TempDir::new().unwrap();
        let repo = Repo::new();
        repo.write("README.md", "hello\n");
        let head = repo.commit("initial");

        strata(scratch.path())
            .args(["head", "--repo"])
            .arg(repo.path())
            .assert()
            .success()
            .stdout(predicate::str::contains(head));
    }

    #[test]
    fn head_outside_repository_fails() {
        let scratch = TempDir::new().unwrap();
        let empty = TempDir::new().unwrap();

        strata(scratch.path())
            .args(["head", "--repo"])
            .arg(empty.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn tags_as_json() {
        let scratch = TempDir::new().unwrap();
        let repo = Repo::new();
        repo.write("a.txt", "a\n");
        repo.commit("initial");
        repo.git(&["tag", "-a", "v1", "-m", "release"]);
        repo.git(&["tag", "v2"]);

        strata(scratch.path())
            .args(["tags", "--json", "--repo"])
            .arg(repo.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("\"v1\"").and(predicate::str::contains("\"v2\"")));
    }

    #[test]
    fn unknown_reference_is_a_usage_error() {
        let scratch = TempDir::new().unwrap();
        let repo = Repo::new();
        repo.write("a.txt", "a\n");
        repo.commit("initial");

        strata(scratch.path())
            .args(["archive", "--commit", "no-such-branch", "--repo"])
            .arg(repo.path())
            .assert()
            .code(2)
            .stderr(predicate::str::contains("Reference not found"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn checksum_reports_unmatched_paths() {
        let scratch = TempDir::new().unwrap();
        let repo = Repo::new();
        repo.write("src/main.rs", "fn main() {}\n");
        repo.commit("initial");

        strata(scratch.path())
            .args(["checksum", "--json", "--path", "src", "--path", "missing", "--repo"])
            .arg(repo.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("\"no_match_paths\""))
            .stdout(predicate::str::contains("\"missing\""));
    }

    #[test]
    fn patch_lists_changed_paths() {
        let scratch = TempDir::new().unwrap();
        let repo = Repo::new();
        repo.write("app/main.txt", "one\n");
        repo.write("docs/readme.txt", "docs\n");
        let from = repo.commit("initial");
        repo.write("app/main.txt", "two\n");
        repo.write("docs/readme.txt", "more docs\n");
        repo.commit("change");
        let out = scratch.path().join("out.patch");

        strata(scratch.path())
            .args(["patch", "--from", from.as_str(), "--include", "app", "--output"])
            .arg(&out)
            .arg("--repo")
            .arg(repo.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("app/main.txt"))
            .stdout(predicate::str::contains("docs/readme.txt").not());

        let patch = std::fs::read_to_string(out).unwrap();
        assert!(patch.contains("+two"));
    }

    #[test]
    fn merge_check_reports_conflict() {
        let scratch = TempDir::new().unwrap();
        let repo = Repo::new();
        repo.write("a.txt", "base\n");
        repo.commit("base");
        repo.git(&["checkout", "-q", "-b", "feature"]);
        repo.write("a.txt", "feature\n");
        repo.commit("feature");
        repo.git(&["checkout", "-q", "main"]);
        repo.write("a.txt", "main\n");
        repo.commit("main");

        strata(scratch.path())
            .args(["merge-check", "--from", "feature", "--to", "main", "--repo"])
            .arg(repo.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("a.txt"));
    }
}

mod round_trip_tests {
    use super::*;
    use std::collections::BTreeMap;
    use strata::config::Config;
    use strata::git::{ArchiveOptions, GitRepo, PatchOptions, PathFilter};
    use strata::EngineContext;

    fn extract(archive: &Path, into: &Path) {
        let file = std::fs::File::open(archive).unwrap();
        tar::Archive::new(file).unpack(into).unwrap();
    }

    /// Relative path -> (content, executable)
    fn snapshot(root: &Path) -> BTreeMap<String, (Vec<u8>, bool)> {
        let mut files = BTreeMap::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                files.insert(rel, (std::fs::read(&path).unwrap(), is_executable(&path)));
            }
        }
        files
    }

    #[cfg(unix)]
    fn is_executable(path: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).unwrap().permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    fn is_executable(_path: &Path) -> bool {
        false
    }

    fn context(scratch: &Path) -> EngineContext {
        let mut config = Config::default();
        config.cache.root = Some(scratch.join("cache"));
        EngineContext::new(&config)
    }

    #[tokio::test]
    async fn patch_applied_to_archive_reproduces_target_archive() {
        let scratch = TempDir::new().unwrap();
        let repo = Repo::new();
        repo.write("app/main.txt", "one\ntwo\nthree\n");
        repo.write("app/old.txt", "going away\n");
        repo.write("app/run.sh", "#!/bin/sh\necho run\n");
        repo.write("other/skip.txt", "outside\n");
        let from = repo.commit("initial");

        repo.write("app/main.txt", "one\n2\nthree\nfour\n");
        repo.remove("app/old.txt");
        repo.write("app/nested/new.txt", "fresh\n");
        repo.make_executable("app/run.sh");
        repo.write("other/skip.txt", "still outside\n");
        let to = repo.commit("change");

        let ctx = context(scratch.path());
        let local = ctx.local_repo("app", repo.path()).unwrap();
        let filter = PathFilter::new("").include("app");

        let archive_from = local
            .create_archive(&ArchiveOptions {
                filter: filter.clone(),
                commit: from.clone(),
            })
            .await
            .unwrap();
        let archive_to = local
            .create_archive(&ArchiveOptions {
                filter: filter.clone(),
                commit: to.clone(),
            })
            .await
            .unwrap();
        let patch = local
            .create_patch(&PatchOptions::new(filter, from.as_str(), to.as_str()))
            .await
            .unwrap();
        assert!(!patch.is_empty());

        let applied = scratch.path().join("applied");
        let expected = scratch.path().join("expected");
        extract(archive_from.path(), &applied);
        extract(archive_to.path(), &expected);

        let status = StdCommand::new("git")
            .arg("apply")
            .arg(patch.path())
            .current_dir(&applied)
            .status()
            .unwrap();
        assert!(status.success());

        let applied = snapshot(&applied);
        assert_eq!(applied, snapshot(&expected));
        assert!(!applied.contains_key("other/skip.txt"));
        assert!(applied.contains_key("app/nested/new.txt"));
        #[cfg(unix)]
        assert!(applied["app/run.sh"].1);
    }

    #[tokio::test]
    async fn repeated_requests_reuse_cached_content() {
        let scratch = TempDir::new().unwrap();
        let repo = Repo::new();
        repo.write("a.txt", "a\n");
        let commit = repo.commit("initial");

        let ctx = context(scratch.path());
        let local = ctx.local_repo("app", repo.path()).unwrap();
        let opts = ArchiveOptions {
            filter: PathFilter::new(""),
            commit,
        };

        let first = local.create_archive(&opts).await.unwrap();
        let second = local.create_archive(&opts).await.unwrap();
        assert_eq!(first.path(), second.path());
        assert_eq!(first.descriptor(), second.descriptor());
        assert_eq!(first.descriptor().file_count, 1);
    }
}

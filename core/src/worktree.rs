//! Worktree path resolution and the plan store. Resolution is the boundary
//! contract with the git layer: given (workdir, org, repo, branch) return the
//! checked-out worktree directory, failing when it does not exist. Plan files
//! are timestamped markdown artefacts dropped into `.plans/` at agent launch.

use std::path::{Path, PathBuf};

use crate::error::{Result, WorkbenchError};

/// Env override for the plan-store root (useful for shared plan archives).
pub const PLAN_STORE_ENV: &str = "AGENTRIX_PLAN_STORE";

const PLANS_DIR: &str = ".plans";
const WORKTREES_DIR: &str = "worktrees";

/// Resolves worktree directories for (workdir, org, repo, branch) triples.
/// The engine only ever consumes the resolved path as an opaque directory.
pub trait WorktreeResolver: Send + Sync {
    fn resolve(&self, workdir: &Path, org: &str, repo: &str, branch: &str) -> Result<PathBuf>;
}

/// Filesystem layout resolver: `<workdir>/<org>/<repo>/worktrees/<branch>`,
/// with `/` in branch names flattened to `-`.
pub struct FsWorktreeResolver;

impl WorktreeResolver for FsWorktreeResolver {
    fn resolve(&self, workdir: &Path, org: &str, repo: &str, branch: &str) -> Result<PathBuf> {
        if org.trim().is_empty() || repo.trim().is_empty() || branch.trim().is_empty() {
            return Err(WorkbenchError::precondition(
                "org, repo and branch are required to resolve a worktree".to_string(),
            ));
        }
        let path = workdir
            .join(org)
            .join(repo)
            .join(WORKTREES_DIR)
            .join(branch_dir_name(branch));
        if !path.is_dir() {
            return Err(WorkbenchError::not_found(format!(
                "No worktree for {org}/{repo}@{branch} at {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

/// Branch names become single path components: `feature/x` → `feature-x`.
pub fn branch_dir_name(branch: &str) -> String {
    branch.replace('/', "-")
}

/// Target directory for a new worktree. Fails with Conflict when something
/// already sits at the path; the git layer populates it afterwards.
pub fn create_worktree_dir(
    workdir: &Path,
    org: &str,
    repo: &str,
    branch: &str,
) -> Result<PathBuf> {
    let path = workdir
        .join(org)
        .join(repo)
        .join(WORKTREES_DIR)
        .join(branch_dir_name(branch));
    if path.exists() {
        return Err(WorkbenchError::conflict(format!(
            "Worktree already exists at {}",
            path.display()
        )));
    }
    std::fs::create_dir_all(&path)
        .map_err(|e| WorkbenchError::external(format!("Failed to create worktree dir: {e}")))?;
    Ok(path)
}

/// Remove a worktree directory. Removing "main" is always refused.
pub fn remove_worktree(workdir: &Path, org: &str, repo: &str, branch: &str) -> Result<()> {
    if branch.trim() == "main" {
        return Err(WorkbenchError::precondition(
            "Refusing to remove the main worktree".to_string(),
        ));
    }
    let path = FsWorktreeResolver.resolve(workdir, org, repo, branch)?;
    std::fs::remove_dir_all(&path)
        .map_err(|e| WorkbenchError::external(format!("Failed to remove worktree: {e}")))
}

/// Filename-safe branch component for plan files.
pub fn safe_branch(branch: &str) -> String {
    let safe: String = branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = safe.trim_matches('-');
    if trimmed.is_empty() {
        "branch".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Plan directory for a worktree, honouring the env override.
pub fn plan_store_root(worktree: &Path) -> PathBuf {
    std::env::var(PLAN_STORE_ENV)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| worktree.join(PLANS_DIR))
}

/// Write a plan file `<root>/<YYYYMMDD_HHMMSS>-<safeBranch>.md` with a
/// guaranteed trailing newline, then prune older files for the same branch
/// down to `retain`.
pub fn write_plan_file(worktree: &Path, branch: &str, plan: &str, retain: usize) -> Result<PathBuf> {
    let root = plan_store_root(worktree);
    std::fs::create_dir_all(&root)
        .map_err(|e| WorkbenchError::external(format!("Failed to create plan store: {e}")))?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let safe = safe_branch(branch);
    let path = root.join(format!("{stamp}-{safe}.md"));

    let mut content = plan.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    std::fs::write(&path, content)
        .map_err(|e| WorkbenchError::external(format!("Failed to write plan file: {e}")))?;

    prune_plans(&root, &safe, retain);
    Ok(path)
}

/// Keep the newest `retain` plans per branch; timestamped names sort
/// chronologically so a lexicographic sort suffices.
fn prune_plans(root: &Path, safe: &str, retain: usize) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    let suffix = format!("-{safe}.md");
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(|n| n.to_string()))
        .filter(|n| n.ends_with(&suffix))
        .collect();
    if names.len() <= retain {
        return;
    }
    names.sort();
    let excess = names.len() - retain;
    for name in names.into_iter().take(excess) {
        let _ = std::fs::remove_file(root.join(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_requires_existing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = FsWorktreeResolver;
        let err = resolver
            .resolve(dir.path(), "acme", "widget", "main")
            .expect_err("missing worktree");
        assert_eq!(err.status_class(), "not_found");

        let worktree = dir.path().join("acme/widget/worktrees/main");
        std::fs::create_dir_all(&worktree).expect("mkdir");
        let resolved = resolver
            .resolve(dir.path(), "acme", "widget", "main")
            .expect("resolves");
        assert_eq!(resolved, worktree);
    }

    #[test]
    fn resolver_flattens_branch_separators() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worktree = dir.path().join("acme/widget/worktrees/feature-x");
        std::fs::create_dir_all(&worktree).expect("mkdir");
        let resolved = FsWorktreeResolver
            .resolve(dir.path(), "acme", "widget", "feature/x")
            .expect("resolves");
        assert_eq!(resolved, worktree);
    }

    #[test]
    fn resolver_rejects_empty_components() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = FsWorktreeResolver
            .resolve(dir.path(), "", "widget", "main")
            .expect_err("empty org");
        assert_eq!(err.status_class(), "precondition_failed");
    }

    #[test]
    fn create_refuses_existing_and_remove_refuses_main() {
        let dir = tempfile::tempdir().expect("tempdir");
        let created = create_worktree_dir(dir.path(), "acme", "widget", "feat").expect("create");
        assert!(created.is_dir());
        let err = create_worktree_dir(dir.path(), "acme", "widget", "feat")
            .expect_err("already exists");
        assert_eq!(err.status_class(), "conflict");

        let err = remove_worktree(dir.path(), "acme", "widget", "main").expect_err("refuses main");
        assert_eq!(err.status_class(), "precondition_failed");

        remove_worktree(dir.path(), "acme", "widget", "feat").expect("remove");
        assert!(!created.exists());
    }

    #[test]
    fn safe_branch_strips_unsafe_characters() {
        assert_eq!(safe_branch("feature/x"), "feature-x");
        assert_eq!(safe_branch("fix bug #42"), "fix-bug--42");
        assert_eq!(safe_branch("///"), "branch");
    }

    #[test]
    fn plan_files_get_trailing_newline_and_prune() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join(".plans");
        std::fs::create_dir_all(&root).expect("mkdir");
        // Seed three older plans for the same branch.
        for stamp in ["20260101_000001", "20260101_000002", "20260101_000003"] {
            std::fs::write(root.join(format!("{stamp}-main.md")), "old\n").expect("seed");
        }
        // A plan for another branch must survive pruning.
        std::fs::write(root.join("20260101_000001-other.md"), "keep\n").expect("seed");

        let path = write_plan_file(dir.path(), "main", "do the thing", 2).expect("write plan");
        let content = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(content, "do the thing\n");

        let remaining: Vec<String> = std::fs::read_dir(&root)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(|n| n.to_string()))
            .filter(|n| n.ends_with("-main.md"))
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(root.join("20260101_000001-other.md").exists());
    }
}

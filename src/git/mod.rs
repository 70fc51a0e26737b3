//! Thin git adaptor over libgit2.
//!
//! Herald only needs repository state (branch, cleanliness) and
//! patch-formatted diffs for the `get_diff` tool, plus branch/stash
//! preparation for auto-branch projects.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::{DiffFormat, DiffOptions, Repository, StatusOptions};

pub struct GitOps {
    path: PathBuf,
}

impl GitOps {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.path)
            .with_context(|| format!("{} is not a git repository", self.path.display()))
    }

    pub fn is_repo(&self) -> bool {
        Repository::open(&self.path).is_ok()
    }

    pub fn has_commits(&self) -> bool {
        self.open()
            .and_then(|r| r.head().map(|_| ()).map_err(Into::into))
            .is_ok()
    }

    /// Short name of the branch HEAD points at. Follows the symbolic
    /// reference directly so it also works on unborn branches.
    pub fn current_branch(&self) -> Option<String> {
        let repo = self.open().ok()?;
        let head = repo.find_reference("HEAD").ok()?;
        let target = head.symbolic_target()?;
        Some(target.strip_prefix("refs/heads/").unwrap_or(target).to_string())
    }

    /// Whether the working tree has no changes (untracked files count as
    /// dirty).
    pub fn is_clean(&self) -> Result<bool> {
        let repo = self.open()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses.is_empty())
    }

    /// Patch-formatted diff of working tree + index against HEAD.
    pub fn diff_head(&self) -> Result<String> {
        let repo = self.open()?;
        let head_tree = repo.head()?.peel_to_tree()?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))?;
        render_patch(&diff)
    }

    /// Patch-formatted diff of `to` against the merge base of `from` and
    /// `to` (the `from...to` three-dot form).
    pub fn diff_range(&self, from: &str, to: &str) -> Result<String> {
        let repo = self.open()?;
        let from_commit = repo.revparse_single(from)?.peel_to_commit()?;
        let to_commit = repo.revparse_single(to)?.peel_to_commit()?;
        let base = repo.merge_base(from_commit.id(), to_commit.id())?;
        let base_tree = repo.find_commit(base)?.tree()?;
        let to_tree = to_commit.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&to_tree), None)?;
        render_patch(&diff)
    }

    /// Create `name` at HEAD and check it out (`git checkout -b`).
    pub fn create_branch(&self, name: &str) -> Result<()> {
        let repo = self.open()?;
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(name, &head, false)
            .with_context(|| format!("creating branch {name:?}"))?;
        repo.set_head(&format!("refs/heads/{name}"))?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.safe();
        repo.checkout_head(Some(&mut checkout))?;
        Ok(())
    }

    /// Stash uncommitted changes before a task touches the tree.
    pub fn stash(&self) -> Result<()> {
        let mut repo = self.open()?;
        let sig = repo
            .signature()
            .or_else(|_| git2::Signature::now("herald", "herald@localhost"))?;
        repo.stash_save(
            &sig,
            "herald: auto-stash before task",
            Some(git2::StashFlags::INCLUDE_UNTRACKED),
        )?;
        Ok(())
    }
}

fn render_patch(diff: &git2::Diff) -> Result<String> {
    let mut out = String::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' | '-' | ' ' => out.push(line.origin()),
            _ => {}
        }
        out.push_str(std::str::from_utf8(line.content()).unwrap_or(""));
        true
    })?;
    Ok(out)
}

/// Convenience wrapper used by `list_projects`.
pub fn state_line(path: &Path) -> Option<String> {
    let ops = GitOps::new(path);
    let branch = ops.current_branch()?;
    let clean = ops.is_clean().unwrap_or(false);
    Some(format!(
        "{} ({})",
        branch,
        if clean { "clean" } else { "dirty" }
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let mut cfg = repo.config().unwrap();
            cfg.set_str("user.name", "test").unwrap();
            cfg.set_str("user.email", "test@example.com").unwrap();
        }
        repo
    }

    fn commit_file(repo: &Repository, name: &str, content: &str, message: &str) {
        let workdir = repo.workdir().unwrap();
        std::fs::write(workdir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = repo.signature().unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap();
    }

    #[test]
    fn branch_on_unborn_repo() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let ops = GitOps::new(dir.path());
        assert!(ops.is_repo());
        assert!(!ops.has_commits());
        // symbolic-ref works before the first commit.
        assert!(ops.current_branch().is_some());
    }

    #[test]
    fn clean_and_dirty_states() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        commit_file(&repo, "a.txt", "one\n", "init");

        let ops = GitOps::new(dir.path());
        assert!(ops.is_clean().unwrap());

        std::fs::write(dir.path().join("b.txt"), "new\n").unwrap();
        assert!(!ops.is_clean().unwrap());
    }

    #[test]
    fn diff_head_shows_workdir_changes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        commit_file(&repo, "a.txt", "one\n", "init");
        std::fs::write(dir.path().join("a.txt"), "two\n").unwrap();

        let ops = GitOps::new(dir.path());
        let patch = ops.diff_head().unwrap();
        assert!(patch.contains("-one"), "{patch}");
        assert!(patch.contains("+two"), "{patch}");
    }

    #[test]
    fn create_branch_and_range_diff() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        commit_file(&repo, "a.txt", "one\n", "init");
        let main = GitOps::new(dir.path()).current_branch().unwrap();

        let ops = GitOps::new(dir.path());
        ops.create_branch("herald/t-1").unwrap();
        commit_file(&repo, "a.txt", "branched\n", "work");

        let patch = ops.diff_range(&main, "herald/t-1").unwrap();
        assert!(patch.contains("+branched"), "{patch}");
    }

    #[test]
    fn not_a_repo() {
        let dir = tempfile::tempdir().unwrap();
        let ops = GitOps::new(dir.path());
        assert!(!ops.is_repo());
        assert!(ops.current_branch().is_none());
        assert!(ops.diff_head().is_err());
    }
}

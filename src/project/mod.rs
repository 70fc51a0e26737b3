//! Configured project registry.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use tracing::warn;

use crate::config::{self, ProjectConfig};
use crate::error::Error;
use crate::git::GitOps;

#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub path: PathBuf,
    pub description: String,
    pub default: bool,
    pub allowed_tools: Vec<String>,
    pub max_concurrent_tasks: usize,
    pub auto_branch: bool,
    pub auto_stash: bool,
    pub branch_prefix: String,
}

impl Project {
    pub fn git(&self) -> GitOps {
        GitOps::new(&self.path)
    }
}

/// Registry of configured projects. Built once from config at startup.
pub struct ProjectManager {
    projects: HashMap<String, Project>,
}

impl ProjectManager {
    pub fn new(configs: &HashMap<String, ProjectConfig>) -> Self {
        let mut projects = HashMap::with_capacity(configs.len());
        for (name, cfg) in configs {
            let branch_prefix = if cfg.git.branch_prefix.is_empty() {
                "herald/".to_string()
            } else {
                cfg.git.branch_prefix.clone()
            };
            projects.insert(
                name.clone(),
                Project {
                    name: name.clone(),
                    path: PathBuf::from(config::expand_home(&cfg.path)),
                    description: cfg.description.clone(),
                    default: cfg.default,
                    allowed_tools: cfg.allowed_tools.clone(),
                    max_concurrent_tasks: cfg.max_concurrent_tasks.max(1),
                    auto_branch: cfg.git.auto_branch,
                    auto_stash: cfg.git.auto_stash,
                    branch_prefix,
                },
            );
        }
        Self { projects }
    }

    /// Check every configured project path at startup.
    pub fn validate(&self) -> Result<()> {
        for p in self.projects.values() {
            let meta = match std::fs::metadata(&p.path) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    bail!(
                        "project {}: path {} does not exist",
                        p.name,
                        p.path.display()
                    );
                }
                Err(e) => bail!("project {}: {e}", p.name),
            };
            if !meta.is_dir() {
                bail!(
                    "project {}: path {} is not a directory",
                    p.name,
                    p.path.display()
                );
            }
            if !p.git().is_repo() {
                warn!(project = %p.name, path = %p.path.display(), "project is not a git repository");
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Project, Error> {
        self.projects
            .get(name)
            .ok_or_else(|| Error::not_found(format!("project {name:?} not found")))
    }

    /// The project marked `default`, or the sole project when only one is
    /// configured.
    pub fn default_project(&self) -> Result<&Project, Error> {
        if let Some(p) = self.projects.values().find(|p| p.default) {
            return Ok(p);
        }
        if self.projects.len() == 1 {
            return Ok(self.projects.values().next().expect("len checked"));
        }
        Err(Error::invalid("no default project configured"))
    }

    /// Resolve a project by name, falling back to the default when empty.
    pub fn resolve(&self, name: &str) -> Result<&Project, Error> {
        if name.is_empty() {
            self.default_project()
        } else {
            self.get(name)
        }
    }

    pub fn all(&self) -> Vec<&Project> {
        let mut all: Vec<&Project> = self.projects.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

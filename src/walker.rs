use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::config::BuildConfig;
use crate::paths::absolute_normalized;

/// One file found under an input root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Path of the file on disk.
    pub source: PathBuf,
    /// Path relative to the walk root (or the path itself for single-file roots).
    pub relative: PathBuf,
}

/// Which paths are left out of walks and watch events.
///
/// Always excludes `node_modules` and anything beneath the output root. Dotfiles are
/// excluded unless configured otherwise, and the configured glob patterns apply.
/// A policy scoped with [`IgnorePolicy::for_root`] also honours the root's ignore files.
#[derive(Debug, Clone)]
pub struct IgnorePolicy {
    patterns: Arc<Vec<glob::Pattern>>,
    include_dotfiles: bool,
    out_dir: PathBuf,
    gitignore: Option<Arc<Gitignore>>,
}

impl IgnorePolicy {
    pub fn from_config(config: &BuildConfig) -> anyhow::Result<Self> {
        let patterns = config
            .ignore
            .iter()
            .map(|p| glob::Pattern::new(p).with_context(|| format!("invalid ignore pattern `{p}`")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            patterns: Arc::new(patterns),
            include_dotfiles: config.include_dotfiles,
            out_dir: absolute_normalized(&config.out_dir),
            gitignore: None,
        })
    }

    /// The same policy, plus the `.gitignore` and `.ignore` rules found at `root`.
    ///
    /// Used for watch events, which never pass through the walker's own ignore handling.
    pub fn for_root(&self, root: &Path) -> Self {
        Self {
            gitignore: Some(Arc::new(build_gitignore_matcher(&absolute_normalized(root)))),
            ..self.clone()
        }
    }

    pub fn include_dotfiles(&self) -> bool {
        self.include_dotfiles
    }

    /// Returns true if `path` should be skipped. `relative` is `path` relative to its root
    /// and is the part checked for dotfile components.
    pub fn is_ignored(&self, path: &Path, relative: &Path) -> bool {
        if path_contains_node_modules(relative) {
            return true;
        }
        if !self.include_dotfiles && has_hidden_component(relative) {
            return true;
        }
        if self.is_in_out_dir(path) {
            return true;
        }
        if self.is_gitignored(path, relative) {
            return true;
        }
        self.is_excluded_by_pattern(path, relative)
    }

    /// Returns true if the root's ignore files exclude `relative` or one of its parents.
    fn is_gitignored(&self, path: &Path, relative: &Path) -> bool {
        let Some(gitignore) = &self.gitignore else {
            return false;
        };
        // The matcher only accepts paths below its root.
        if relative.has_root() || relative.as_os_str().is_empty() {
            return false;
        }
        gitignore
            .matched_path_or_any_parents(relative, path.is_dir())
            .is_ignore()
    }

    /// Returns true if `path` lies beneath the output root.
    pub fn is_in_out_dir(&self, path: &Path) -> bool {
        absolute_normalized(path).starts_with(&self.out_dir)
    }

    /// Returns true if `path` or `relative` matches any configured exclusion pattern.
    fn is_excluded_by_pattern(&self, path: &Path, relative: &Path) -> bool {
        let path_str = path.to_string_lossy();
        let relative_str = relative.to_string_lossy();

        for pattern in self.patterns.iter() {
            if pattern.matches(&path_str) || pattern.matches(&relative_str) {
                return true;
            }
            // Also check if any component below the root matches the pattern directly.
            for component in relative.components() {
                if let Some(s) = component.as_os_str().to_str()
                    && pattern.matches(s)
                {
                    return true;
                }
            }
        }

        false
    }
}

/// Lazily walk `root` and yield every file that survives the ignore policy.
///
/// Respects `.gitignore`/`.ignore` files (even outside a git repository) and prunes
/// ignored directories without descending into them. The iterator is consumed once.
pub fn walk_sources(root: &Path, policy: &IgnorePolicy) -> impl Iterator<Item = SourceEntry> + use<> {
    let prune_policy = policy.clone();
    let prune_root = root.to_path_buf();

    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(true)
        .hidden(!policy.include_dotfiles())
        // Read .gitignore files even when the directory is not inside a git repository.
        .require_git(false)
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let relative = entry.path().strip_prefix(&prune_root).unwrap_or(entry.path());
            !prune_policy.is_ignored(entry.path(), relative)
        })
        .build();

    let root = root.to_path_buf();
    walker.filter_map(move |result| {
        let entry = match result {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!("{err}");
                return None;
            }
        };

        let path = entry.path();
        let is_file = match entry.file_type() {
            Some(ft) if ft.is_dir() => false,
            Some(ft) if ft.is_symlink() => path.is_file(),
            Some(_) => true,
            None => false,
        };
        if !is_file {
            return None;
        }

        let relative = path.strip_prefix(&root).unwrap_or(path).to_path_buf();
        Some(SourceEntry {
            source: path.to_path_buf(),
            relative,
        })
    })
}

/// Build a matcher from the ignore files directly inside `root`.
/// Missing files yield an empty matcher; unreadable ones are logged and skipped.
fn build_gitignore_matcher(root: &Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);
    for name in [".gitignore", ".ignore"] {
        let file = root.join(name);
        if file.is_file()
            && let Some(err) = builder.add(&file)
        {
            tracing::warn!("{}: {err}", file.display());
        }
    }
    builder.build().unwrap_or_else(|err| {
        tracing::warn!("ignoring rules under {}: {err}", root.display());
        Gitignore::empty()
    })
}

/// Returns true if any component of `path` is named `node_modules`.
fn path_contains_node_modules(path: &Path) -> bool {
    path.components().any(|c| c.as_os_str() == "node_modules")
}

/// Returns true if any component of `path` starts with a dot (`.` and `..` excluded).
fn has_hidden_component(path: &Path) -> bool {
    path.components().any(|c| match c {
        std::path::Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

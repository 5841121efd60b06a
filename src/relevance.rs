use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Recursive,
    Shallow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRoot {
    pub path: PathBuf,
    pub mode: WatchMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relevance {
    /// The platform could not say what changed.
    Unknown,
    TargetCreated(PathBuf),
    Changed(PathBuf),
    Irrelevant,
}

impl Relevance {
    pub fn should_refresh(&self) -> bool {
        !matches!(self, Relevance::Irrelevant)
    }
}

/// Existing targets are watched recursively under their canonical path.
/// For a target that does not exist yet, its nearest existing ancestor is
/// watched shallowly and the first missing component below that ancestor
/// becomes a creation marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchTargets {
    requested: Vec<PathBuf>,
    roots: Vec<PathBuf>,
    fallbacks: Vec<PathBuf>,
    markers: Vec<PathBuf>,
}

impl WatchTargets {
    pub fn resolve(targets: &[PathBuf]) -> Self {
        let mut resolved = Self {
            requested: targets.to_vec(),
            ..Self::default()
        };

        for target in targets {
            let standardized = standardize_path(target);
            if standardized.exists() {
                push_unique(&mut resolved.roots, standardized);
                continue;
            }
            match nearest_existing_ancestor(&standardized) {
                Some((ancestor, marker)) => {
                    push_unique(&mut resolved.fallbacks, ancestor);
                    push_unique(&mut resolved.markers, marker);
                }
                None => debug!(target = %target.display(), "no existing ancestor to watch"),
            }
        }
        resolved
    }

    pub fn requested(&self) -> &[PathBuf] {
        &self.requested
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn markers(&self) -> &[PathBuf] {
        &self.markers
    }

    // Fallbacks inside a recursive root are already covered by it.
    pub fn watch_roots(&self) -> Vec<WatchRoot> {
        let recursive = self.roots.iter().map(|path| WatchRoot {
            path: path.clone(),
            mode: WatchMode::Recursive,
        });
        let shallow = self
            .fallbacks
            .iter()
            .filter(|fallback| !self.roots.iter().any(|root| fallback.starts_with(root)))
            .map(|path| WatchRoot {
                path: path.clone(),
                mode: WatchMode::Shallow,
            });
        recursive.chain(shallow).collect()
    }

    pub fn classify(&self, batch: &[PathBuf]) -> Relevance {
        if batch.is_empty() {
            return Relevance::Unknown;
        }
        let standardized: Vec<PathBuf> = batch.iter().map(|path| standardize_path(path)).collect();

        for path in &standardized {
            if let Some(marker) = self.markers.iter().find(|marker| path.starts_with(marker)) {
                return Relevance::TargetCreated(marker.clone());
            }
        }
        for path in &standardized {
            if self.roots.iter().any(|root| path.starts_with(root)) {
                return Relevance::Changed(path.clone());
            }
        }
        Relevance::Irrelevant
    }
}

/// Resolves symlinks in the longest existing prefix of `path` and appends
/// the remaining components unchanged, so deleted or not-yet-created paths
/// still compare equal to their canonical siblings.
pub fn standardize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let mut suffix = Vec::new();
    let mut current = path;
    while let Some(parent) = current.parent() {
        let Some(name) = current.file_name() else {
            break;
        };
        suffix.push(name.to_os_string());
        if let Ok(mut base) = fs::canonicalize(parent) {
            for component in suffix.iter().rev() {
                base.push(component);
            }
            return base;
        }
        current = parent;
    }
    path.to_path_buf()
}

fn nearest_existing_ancestor(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let mut child = path;
    for ancestor in path.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            return None;
        }
        if ancestor.is_dir() {
            return Some((ancestor.to_path_buf(), child.to_path_buf()));
        }
        child = ancestor;
    }
    None
}

fn push_unique(paths: &mut Vec<PathBuf>, path: PathBuf) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

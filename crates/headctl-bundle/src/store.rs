//! [`BundleStore`] – loads bundles by name from one configured directory.
//!
//! Names are untrusted (they arrive over the broker). A name is accepted only
//! if it is a plain relative path and its fully resolved location, symlinks
//! included, is still inside the bundle directory. Both checks happen before
//! the file is opened.
//!
//! Loaded bundles are shared as `Arc<AnimationBundle>`. The store itself only
//! keeps a `Weak` reference, so a bundle is freed as soon as the last session
//! playing it ends.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use headctl_types::HeadError;
use tracing::{debug, info};

use crate::format::{self, AnimationBundle};

pub struct BundleStore {
    root: PathBuf,
    cache: HashMap<PathBuf, Weak<AnimationBundle>>,
}

impl BundleStore {
    /// Open the store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::FatalStartup`] if `dir` does not exist or is not a
    /// directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, HeadError> {
        let dir = dir.as_ref();
        let root = dir.canonicalize().map_err(|e| {
            HeadError::FatalStartup(format!("bundle directory {}: {e}", dir.display()))
        })?;
        if !root.is_dir() {
            return Err(HeadError::FatalStartup(format!(
                "bundle directory {} is not a directory",
                root.display()
            )));
        }
        info!(root = %root.display(), "bundle store opened");
        Ok(Self {
            root,
            cache: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` to a canonical file path inside the root.
    ///
    /// # Errors
    ///
    /// * [`HeadError::PathViolation`] – `name` is empty, absolute, contains
    ///   `..`, or resolves (through symlinks) outside the root.
    /// * [`HeadError::BundleNotFound`] – nothing (or no regular file) at the
    ///   resolved location.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf, HeadError> {
        let relative = Path::new(name);
        let lexically_plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !lexically_plain {
            return Err(HeadError::PathViolation(name.to_string()));
        }

        let candidate = self.root.join(relative);
        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(p) => p,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(HeadError::BundleNotFound(name.to_string()));
            }
            Err(e) => return Err(HeadError::Io(format!("{}: {e}", candidate.display()))),
        };
        if !resolved.starts_with(&self.root) {
            return Err(HeadError::PathViolation(name.to_string()));
        }

        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| HeadError::Io(format!("{}: {e}", resolved.display())))?;
        if !meta.is_file() {
            return Err(HeadError::BundleNotFound(name.to_string()));
        }
        Ok(resolved)
    }

    /// Resolve, read and validate the bundle called `name`.
    ///
    /// Returns the cached instance when a live session already holds it.
    pub async fn load(&mut self, name: &str) -> Result<Arc<AnimationBundle>, HeadError> {
        let path = self.resolve(name).await?;

        if let Some(bundle) = self.cache.get(&path).and_then(Weak::upgrade) {
            debug!(bundle = name, "bundle cache hit");
            return Ok(bundle);
        }

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| HeadError::Io(format!("{}: {e}", path.display())))?;
        let bundle = Arc::new(format::decode(name, &data)?);
        info!(
            bundle = name,
            duration_ms = bundle.duration_ms,
            gaze_keyframes = bundle.gaze.len(),
            mouth_keyframes = bundle.mouth.len(),
            "bundle loaded"
        );
        self.evict_unused();
        self.cache.insert(path, Arc::downgrade(&bundle));
        Ok(bundle)
    }

    /// Drop cache entries whose bundle is no longer referenced.
    pub fn evict_unused(&mut self) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, weak| weak.strong_count() > 0);
        before - self.cache.len()
    }

    /// Number of bundles currently held by at least one session.
    pub fn resident(&self) -> usize {
        self.cache.values().filter(|w| w.strong_count() > 0).count()
    }
}

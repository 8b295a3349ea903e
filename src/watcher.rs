//! Picking up new model files as training produces them.
//!
//! A model path pattern contains exactly one `%d` in its basename (the
//! directory part must not contain `*` or `%`). The [`DirectoryWatcher`]
//! polls the directory for the file matching the pattern with the largest
//! integer generation and invokes a callback whenever it changes. The
//! [`ReloadingBackend`] wraps a [`ModelFactory`] and transparently rebuilds
//! its backend when a newer generation appears.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::info;

use crate::executor::PollThread;
use crate::model::{FeatureDescriptor, InferenceBackend, ModelFactory, ModelInput, ModelOutput};

/// A parsed `%d` model path pattern.
#[derive(Clone, Debug)]
pub struct ModelPathPattern {
    directory: PathBuf,
    prefix: String,
    suffix: String,
}

impl ModelPathPattern {
    /// True if the path contains a `%d` matcher and therefore names a
    /// pattern rather than a concrete file.
    pub fn is_pattern(path: &str) -> bool {
        path.contains("%d")
    }

    pub fn parse(pattern: &str) -> Result<ModelPathPattern> {
        let path = Path::new(pattern);
        let directory = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        let dir_str = directory.to_string_lossy();
        if dir_str.is_empty() {
            bail!("invalid pattern {:?}: directory part must not be empty", pattern);
        }
        if dir_str.contains('%') || dir_str.contains('*') {
            bail!(
                "invalid pattern {:?}: directory part must not contain '*' or '%'",
                pattern
            );
        }

        let basename = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some(idx) = basename.find("%d") else {
            bail!("invalid pattern {:?}: basename must contain \"%d\"", pattern);
        };
        let prefix = basename[..idx].to_string();
        let suffix = basename[idx + 2..].to_string();
        if prefix.contains('%') || suffix.contains('%') {
            bail!(
                "invalid pattern {:?}: basename must contain exactly one \"%d\" and no other \
                 matchers",
                pattern
            );
        }

        Ok(ModelPathPattern {
            directory,
            prefix,
            suffix,
        })
    }

    /// Extracts the integer generation from a basename, requiring the whole
    /// name to match the pattern (not just a prefix).
    pub fn match_basename(&self, basename: &str) -> Option<i64> {
        let rest = basename.strip_prefix(&self.prefix)?;
        let digits = rest.strip_suffix(&self.suffix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// The matching path with the largest generation, if any. A missing or
    /// unreadable directory is an expected absence, not an error.
    pub fn latest(&self) -> Option<(i64, PathBuf)> {
        let entries = std::fs::read_dir(&self.directory).ok()?;
        let mut latest: Option<(i64, PathBuf)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(generation) = self.match_basename(&name.to_string_lossy()) else {
                continue;
            };
            if latest.as_ref().is_none_or(|(g, _)| generation > *g) {
                latest = Some((generation, self.directory.join(name)));
            }
        }
        latest
    }
}

/// Polls a directory for new files matching a `%d` pattern, invoking
/// `callback` with the full path whenever a later generation appears. The
/// callback runs on the polling thread and must not block for long.
pub struct DirectoryWatcher {
    poll_thread: PollThread,
}

impl DirectoryWatcher {
    pub fn new(
        pattern: &str,
        poll_interval: Duration,
        mut callback: impl FnMut(&str) + Send + 'static,
    ) -> Result<DirectoryWatcher> {
        let pattern = ModelPathPattern::parse(pattern)
            .with_context(|| format!("watching {:?}", pattern))?;
        let mut latest_path: Option<PathBuf> = None;
        let mut poll_thread = PollThread::new("directory-watcher", poll_interval, move || {
            let Some((_, path)) = pattern.latest() else {
                return;
            };
            if latest_path.as_ref() == Some(&path) {
                return;
            }
            latest_path = Some(path.clone());
            callback(&path.to_string_lossy());
        });
        poll_thread.start();
        Ok(DirectoryWatcher { poll_thread })
    }

    pub fn join(&mut self) {
        self.poll_thread.join();
    }
}

/// An [`InferenceBackend`] that follows a `%d` pattern: before each batch it
/// checks (at most once per poll interval) whether a newer generation
/// exists, rebuilding the wrapped backend when one does.
///
/// Construction blocks, polling, until a first matching model appears.
pub struct ReloadingBackend {
    factory: Box<dyn ModelFactory>,
    pattern: ModelPathPattern,
    poll_interval: Duration,
    last_poll: Instant,
    current_path: String,
    current: Box<dyn InferenceBackend>,
}

impl ReloadingBackend {
    pub fn new(
        factory: Box<dyn ModelFactory>,
        pattern_str: &str,
        poll_interval: Duration,
    ) -> Result<ReloadingBackend> {
        let pattern = ModelPathPattern::parse(pattern_str)?;
        info!("waiting for a model to match pattern {}", pattern_str);
        let (_, path) = loop {
            if let Some(found) = pattern.latest() {
                break found;
            }
            std::thread::sleep(poll_interval);
        };
        let current_path = path.to_string_lossy().to_string();
        let current = factory.new_backend(&current_path)?;
        info!("loaded model {}", current_path);
        Ok(ReloadingBackend {
            factory,
            pattern,
            poll_interval,
            last_poll: Instant::now(),
            current_path,
            current,
        })
    }

    fn maybe_reload(&mut self) {
        if self.last_poll.elapsed() < self.poll_interval {
            return;
        }
        self.last_poll = Instant::now();
        let Some((_, path)) = self.pattern.latest() else {
            return;
        };
        let path = path.to_string_lossy().to_string();
        if path == self.current_path {
            return;
        }
        match self.factory.new_backend(&path) {
            Ok(backend) => {
                info!("reloaded model {} (was {})", path, self.current_path);
                self.current = backend;
                self.current_path = path;
            }
            Err(e) => {
                log::error!("failed to load model {}: {:#}", path, e);
            }
        }
    }
}

impl InferenceBackend for ReloadingBackend {
    fn name(&self) -> &str {
        self.current.name()
    }

    fn feature_descriptor(&self) -> FeatureDescriptor {
        self.current.feature_descriptor()
    }

    fn run_many(&mut self, inputs: &[ModelInput], outputs: &mut [ModelOutput]) -> String {
        self.maybe_reload();
        self.current.run_many(inputs, outputs)
    }
}

use std::{
    fs::File,
    future::Future,
    path::{Path, PathBuf},
    thread,
};

use anyhow::{Context, Result, anyhow};
use nix::sched::{CloneFlags, setns};

/// Handle to a network namespace referenced by path (usually
/// `/var/run/netns/<name>` or `/proc/<pid>/ns/net`).
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: File,
}

impl NetNs {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("failed to open netns {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Runs `f` on a dedicated thread that has joined the namespace.
    ///
    /// The thread is discarded afterwards so the namespace switch never leaks
    /// into a pooled runtime thread.
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        thread::scope(|scope| {
            scope
                .spawn(|| {
                    setns(&self.file, CloneFlags::CLONE_NEWNET).with_context(|| {
                        format!("failed to enter netns {}", self.path.display())
                    })?;
                    f()
                })
                .join()
                .map_err(|_| anyhow!("netns worker for {} panicked", self.path.display()))?
        })
    }

    /// Like [`NetNs::run`] but drives a future on a single threaded runtime
    /// owned by the namespace thread.
    pub fn run_async<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>>,
        T: Send,
    {
        self.run(|| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build netns runtime")?;
            rt.block_on(f())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_namespace_fails() {
        let err = NetNs::open("/nonexistent/netns/path").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/netns/path"));
    }
}

use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use palaver_common::{Error, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::loader::ConfigLoader;
use crate::model::AppConfig;

/// An immutable, numbered view of the configuration. Versions increase by one
/// with every successful reload or edit.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: AppConfig,
}

/// Owner of the current [`ConfigSnapshot`].
///
/// Readers either take [`current`](Self::current) or [`subscribe`](Self::subscribe)
/// to be woken on every swap. Components holding state derived from the
/// config are expected to be reconfigured by whoever observes the swap.
pub struct ConfigHandle {
    loader: ConfigLoader,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
}

impl ConfigHandle {
    pub fn new(loader: ConfigLoader, config: AppConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ConfigSnapshot { version: 1, config }));
        Self { loader, tx }
    }

    pub fn load(loader: ConfigLoader) -> Result<Self> {
        let config = loader.load()?;
        Ok(Self::new(loader, config))
    }

    pub fn loader(&self) -> &ConfigLoader {
        &self.loader
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.tx.subscribe()
    }

    /// Re-read the config file and publish it. A file that fails to parse or
    /// validate leaves the current snapshot in place.
    pub fn reload(&self) -> Result<Arc<ConfigSnapshot>> {
        let config = self.loader.load()?;
        Ok(self.publish(config))
    }

    /// Apply `edit` to a copy of the current config, validate, publish and
    /// persist it.
    pub fn update<F>(&self, edit: F) -> Result<Arc<ConfigSnapshot>>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = self.current().config.clone();
        edit(&mut config);
        config.validate()?;
        self.loader.save(&config)?;
        Ok(self.publish(config))
    }

    fn publish(&self, config: AppConfig) -> Arc<ConfigSnapshot> {
        self.tx.send_modify(|current| {
            *current = Arc::new(ConfigSnapshot {
                version: current.version + 1,
                config,
            });
        });
        let snapshot = self.current();
        info!("config snapshot v{} published", snapshot.version);
        snapshot
    }

    /// Reload whenever the config file changes on disk. Keep the returned
    /// watcher alive for as long as reloads should happen.
    pub fn watch_file(self: &Arc<Self>) -> Result<(RecommendedWatcher, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::channel(1);
        let config_dir = self.loader.config_dir().to_path_buf();
        std::fs::create_dir_all(&config_dir)?;

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let touches_config = event.paths.iter().any(|p| {
                        p.file_name()
                            .is_some_and(|name| name == "config.yml" || name == "config.toml")
                    });
                    if touches_config && (event.kind.is_modify() || event.kind.is_create()) {
                        let _ = tx.blocking_send(());
                    }
                }
                Err(e) => error!("config watch error: {}", e),
            })
            .map_err(|e| Error::Config(format!("failed to create config watcher: {e}")))?;

        watcher
            .watch(&config_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Config(format!("failed to watch {}: {e}", config_dir.display())))?;

        let handle = Arc::clone(self);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                if let Err(e) = handle.reload() {
                    warn!("config reload failed, keeping previous snapshot: {}", e);
                }
            }
        });

        info!("watching {} for config changes", config_dir.display());
        Ok((watcher, task))
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigHandle;
    use crate::loader::ConfigLoader;
    use std::fs;

    #[tokio::test]
    async fn reload_bumps_version_and_notifies_subscribers() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let handle = ConfigHandle::load(ConfigLoader::with_dir(dir.path())).unwrap();
        let mut rx = handle.subscribe();
        assert_eq!(handle.current().version, 1);

        fs::write(dir.path().join("config.yml"), "openai:\n  model: gpt-4\n").unwrap();
        let snapshot = handle.reload().expect("reload should succeed");

        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.config.openai.model, "gpt-4");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().version, 2);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let handle = ConfigHandle::load(ConfigLoader::with_dir(dir.path())).unwrap();

        fs::write(dir.path().join("config.yml"), "llm: [not, a, map]\n").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.current().version, 1);
    }

    #[tokio::test]
    async fn update_validates_and_persists() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let handle = ConfigHandle::load(ConfigLoader::with_dir(dir.path())).unwrap();

        assert!(handle.update(|c| c.llm.context_messages = 0).is_err());
        assert_eq!(handle.current().version, 1);

        let snapshot = handle
            .update(|c| c.openai.model = "gpt-4o".into())
            .expect("update should succeed");
        assert_eq!(snapshot.version, 2);

        let on_disk = ConfigLoader::with_dir(dir.path()).load().unwrap();
        assert_eq!(on_disk.openai.model, "gpt-4o");
    }
}

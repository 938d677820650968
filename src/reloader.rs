//! Background polling of the route file
//!
//! The reloader wakes up every poll interval (or when triggered), asks the
//! loader for a fresh table and installs it if the file changed. Errors after
//! startup only skip one cycle: the last good table keeps serving.

use crate::loader::{load, LoadOutcome};
use crate::table::SharedTable;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Periodically refreshes a [`TableHolder`](crate::table::TableHolder)
pub struct Reloader {
    path: PathBuf,
    poll_interval: Duration,
    table: SharedTable,
    wake: Arc<Notify>,
}

impl Reloader {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, table: SharedTable) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            table,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle that wakes the loop for an immediate check
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Check the route file once and install a newer table.
    ///
    /// Returns `true` if a new table was installed.
    pub async fn reload_once(&self) -> bool {
        let path = self.path.clone();
        let installed = self.table.version();

        // File I/O and decoding stay off the runtime threads and outside the lock
        let result = tokio::task::spawn_blocking(move || load(&path, Some(installed))).await;

        match result {
            Ok(Ok(LoadOutcome::Loaded(table))) => {
                let routes = table.len();
                let routable = table.routable_count();
                self.table.install(table);
                info!(
                    path = %self.path.display(),
                    routes,
                    routable,
                    "Route table reloaded"
                );
                true
            }
            Ok(Ok(LoadOutcome::Unchanged)) => false,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to reload routes, keeping current table");
                false
            }
            Err(e) => {
                warn!(error = %e, "Route reload task failed, keeping current table");
                false
            }
        }
    }

    /// Run until `shutdown_rx` turns `true`
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            path = %self.path.display(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Route reloader started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wake.notified() => {
                    debug!("Route reload triggered");
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.reload_once().await;
        }

        info!("Route reloader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableHolder;
    use std::path::Path;
    use std::time::SystemTime;

    fn bump_mtime(path: &Path, secs: u64) {
        let f = std::fs::File::options().write(true).open(path).unwrap();
        f.set_modified(SystemTime::now() + Duration::from_secs(secs)).unwrap();
    }

    #[tokio::test]
    async fn test_reload_installs_newer_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        std::fs::write(&path, r#"[{"host": "a.com", "forward": "10.0.0.1:80"}]"#).unwrap();

        let table = TableHolder::load(&path).unwrap();
        let reloader = Reloader::new(&path, Duration::from_secs(10), Arc::clone(&table));

        assert!(!reloader.reload_once().await);

        std::fs::write(&path, r#"[{"host": "b.com", "forward": "10.0.0.2:80"}]"#).unwrap();
        bump_mtime(&path, 5);

        assert!(reloader.reload_once().await);
        let current = table.current();
        assert!(current.lookup("a.com").is_none());
        assert!(current.lookup("b.com").is_some());
    }

    #[tokio::test]
    async fn test_reload_errors_keep_current_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        std::fs::write(&path, r#"[{"host": "a.com", "forward": "10.0.0.1:80"}]"#).unwrap();

        let table = TableHolder::load(&path).unwrap();
        let reloader = Reloader::new(&path, Duration::from_secs(10), Arc::clone(&table));

        // Malformed content
        std::fs::write(&path, "[{").unwrap();
        bump_mtime(&path, 5);
        assert!(!reloader.reload_once().await);
        assert!(table.current().lookup("a.com").is_some());

        // File briefly missing (editor rename dance)
        std::fs::remove_file(&path).unwrap();
        assert!(!reloader.reload_once().await);
        assert!(table.current().lookup("a.com").is_some());

        // Recovers once a valid file is back
        std::fs::write(&path, r#"[{"host": "c.com", "serve": "/srv/c"}]"#).unwrap();
        bump_mtime(&path, 10);
        assert!(reloader.reload_once().await);
        assert!(table.current().lookup("c.com").is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        std::fs::write(&path, "[]").unwrap();

        let table = TableHolder::load(&path).unwrap();
        let reloader = Reloader::new(&path, Duration::from_millis(20), table);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(reloader.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reloader should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_trigger_reloads_before_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        std::fs::write(&path, "[]").unwrap();

        let table = TableHolder::load(&path).unwrap();
        let reloader = Reloader::new(&path, Duration::from_secs(3600), Arc::clone(&table));
        let trigger = reloader.trigger();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(reloader.run(shutdown_rx));

        std::fs::write(&path, r#"[{"host": "a.com", "forward": "10.0.0.1:80"}]"#).unwrap();
        bump_mtime(&path, 5);
        trigger.notify_one();

        let mut reloaded = false;
        for _ in 0..100 {
            if table.current().lookup("a.com").is_some() {
                reloaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reloaded);
    }
}

//! Top-level launcher controller.
//!
//! Owns the persisted settings, the instance registry, and the supervisor,
//! and turns user actions (start, stop, quit) and supervisor events into
//! calls on them. Actions are issued one at a time by the front end, so the
//! registry needs no locking.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use ailaunch_core::{LauncherConfig, RecentField};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserOpener, local_url};
use crate::registry::{InstanceInfo, InstanceRegistry};
use crate::subprocess::port::{DEFAULT_START_PORT, default_end};
use crate::subprocess::{
    LaunchRequest, OutputStream, ProcessEvent, Supervisor, SupervisorError, find_free_port_in,
};

/// Errors surfaced to the user by the controller.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("No target directory given and none remembered")]
    NoDirectory,

    #[error("Directory does not exist: {}", .path.display())]
    DirectoryMissing { path: PathBuf },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Settings(#[from] ailaunch_core::Error),
}

/// Values for one start action. `None` falls back to the saved setting.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub directory: Option<PathBuf>,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub model: Option<String>,
}

/// Why [`Launcher::supervise`] returned.
#[derive(Debug)]
pub enum RunOutcome {
    /// The shutdown future completed. Instances are still running.
    Interrupted,
    /// No instances are left. Carries the last failure reported, if any.
    Exited(Option<SupervisorError>),
}

/// The launcher's top-level controller.
pub struct Launcher {
    settings: LauncherConfig,
    registry: InstanceRegistry,
    supervisor: Supervisor,
    browser: Arc<dyn BrowserOpener>,
    port_start: u16,
    port_end: u16,
}

impl Launcher {
    pub fn new(
        settings: LauncherConfig,
        registry: InstanceRegistry,
        supervisor: Supervisor,
        browser: Arc<dyn BrowserOpener>,
    ) -> Self {
        Self {
            settings,
            registry,
            supervisor,
            browser,
            port_start: DEFAULT_START_PORT,
            port_end: default_end(DEFAULT_START_PORT),
        }
    }

    /// Allocate ports from `start` through `start + span - 1`.
    #[must_use]
    pub const fn with_port_range(mut self, start: u16, span: u16) -> Self {
        self.port_start = start;
        self.port_end = start.saturating_add(span.saturating_sub(1));
        self
    }

    pub const fn settings(&self) -> &LauncherConfig {
        &self.settings
    }

    pub const fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.registry.snapshot()
    }

    /// Start a new instance and return the port it was given.
    pub async fn start(&mut self, options: StartOptions) -> Result<u16, LauncherError> {
        let directory = options
            .directory
            .or_else(|| self.settings.directory.clone())
            .ok_or(LauncherError::NoDirectory)?;
        if !directory.is_dir() {
            return Err(LauncherError::DirectoryMissing { path: directory });
        }

        self.settings
            .set(RecentField::Directory, &directory.display().to_string());
        for (field, value) in [
            (RecentField::ApiKey, options.api_key),
            (RecentField::ApiBase, options.api_base),
            (RecentField::Model, options.model),
        ] {
            if let Some(value) = value {
                self.settings.set(field, &value);
            }
        }
        self.persist_settings();

        let claimed = self.registry.claimed_ports();
        let reserved = find_free_port_in(self.port_start, self.port_end, &claimed)?;
        let request = LaunchRequest::new(&directory, reserved.port())?
            .with_api_key(&self.settings.api_key)
            .with_api_base(&self.settings.api_base)
            .with_model(&self.settings.model);

        // Hand the port over as late as possible.
        let port = reserved.release();
        let process = self.supervisor.launch(request).await?;
        info!(port, pid = process.pid(), directory = %directory.display(), "Instance starting");
        self.registry.insert(process)?;
        Ok(port)
    }

    /// Stop the instance on `port`. Returns `false` if there was none.
    pub async fn stop(&mut self, port: u16) -> Result<bool, LauncherError> {
        let Some(process) = self.registry.remove(port) else {
            return Ok(false);
        };
        self.supervisor.stop(&process).await?;
        info!(port, "Instance stopped");
        Ok(true)
    }

    /// Stop every instance. All are attempted; the first error is returned.
    pub async fn shutdown(&mut self) -> Result<(), LauncherError> {
        let mut first_error = None;
        for process in self.registry.drain() {
            let port = process.port();
            if let Err(e) = self.supervisor.stop(&process).await {
                error!(port, error = %e, "Failed to stop instance cleanly");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Feed supervisor events to [`handle_event`](Self::handle_event) until
    /// `shutdown` completes or the last instance is gone.
    ///
    /// Events already queued when the registry empties are still handled,
    /// so the returned failure is the one that ended the last instance.
    pub async fn supervise(
        &mut self,
        events: &mut UnboundedReceiver<ProcessEvent>,
        shutdown: impl Future<Output = ()>,
    ) -> RunOutcome {
        tokio::pin!(shutdown);
        let mut last_failure = None;
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => return RunOutcome::Interrupted,
                event = events.recv() => {
                    let Some(event) = event else {
                        return RunOutcome::Exited(last_failure);
                    };
                    if let Some(e) = self.handle_event(event).await {
                        last_failure = Some(e);
                    }
                    if self.registry.is_empty() {
                        while let Ok(event) = events.try_recv() {
                            if let Some(e) = self.handle_event(event).await {
                                last_failure = Some(e);
                            }
                        }
                        return RunOutcome::Exited(last_failure);
                    }
                }
            }
        }
    }

    /// React to one supervisor event. Returns the failure an `Error` event
    /// carried.
    pub async fn handle_event(&mut self, event: ProcessEvent) -> Option<SupervisorError> {
        match event {
            ProcessEvent::Output { port, stream, line } => {
                match stream {
                    OutputStream::Stdout => info!(port, "{}", line),
                    OutputStream::Stderr => warn!(port, "{}", line),
                }
                None
            }
            ProcessEvent::Ready { port } => {
                let url = local_url(port);
                info!(port, url, "Assistant is ready");
                if let Err(e) = self.browser.open(&url) {
                    warn!(port, error = %e, "Could not open browser; visit {url} manually");
                }
                None
            }
            ProcessEvent::State { port, state } => {
                debug!(port, %state, "Instance state");
                None
            }
            ProcessEvent::Error { port, error } => {
                error!(port, %error, "Instance failed");
                // The supervisor already cleaned up; this only drops the entry.
                if let Some(process) = self.registry.remove(port) {
                    if let Err(e) = self.supervisor.stop(&process).await {
                        warn!(port, error = %e, "Cleanup after failure reported an error");
                    }
                }
                Some(error)
            }
        }
    }

    fn persist_settings(&self) {
        if let Err(e) = self.settings.save() {
            warn!(error = %e, "Failed to save settings");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::browser::NoBrowser;
    use crate::subprocess::SupervisorConfig;

    fn launcher(settings: LauncherConfig) -> Launcher {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let supervisor = Supervisor::new(SupervisorConfig::new("/definitely/not/here/ai"), tx);
        Launcher::new(settings, InstanceRegistry::new(), supervisor, Arc::new(NoBrowser))
    }

    #[tokio::test]
    async fn start_without_directory_fails() {
        let mut l = launcher(LauncherConfig::default());
        let err = l.start(StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, LauncherError::NoDirectory));
    }

    #[tokio::test]
    async fn start_with_missing_directory_fails() {
        let mut l = launcher(LauncherConfig::default());
        let err = l
            .start(StartOptions {
                directory: Some("/definitely/not/here".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::DirectoryMissing { .. }));
    }

    #[tokio::test]
    async fn start_records_settings_even_when_launch_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings_path = dir.path().join("config.json");
        let mut l = launcher(LauncherConfig::load(&settings_path));

        let err = l
            .start(StartOptions {
                directory: Some(dir.path().to_path_buf()),
                model: Some("m-test".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LauncherError::Supervisor(SupervisorError::ExecutableNotFound { .. })
        ));
        assert!(l.registry().is_empty());

        let saved = LauncherConfig::load(&settings_path);
        assert_eq!(saved.model, "m-test");
        assert_eq!(saved.recent_directories, [dir.path().display().to_string()]);
    }

    #[test]
    fn port_range_is_inclusive() {
        let l = launcher(LauncherConfig::default()).with_port_range(9000, 10);
        assert_eq!((l.port_start, l.port_end), (9000, 9009));
    }

    #[tokio::test]
    async fn supervise_returns_on_shutdown() {
        let mut l = launcher(LauncherConfig::default());
        let (_tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let outcome = l.supervise(&mut rx, async {}).await;
        assert!(matches!(outcome, RunOutcome::Interrupted));
    }

    #[tokio::test]
    async fn supervise_ends_when_events_close() {
        let mut l = launcher(LauncherConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProcessEvent>();
        drop(tx);
        let outcome = l.supervise(&mut rx, std::future::pending()).await;
        assert!(matches!(outcome, RunOutcome::Exited(None)));
    }

    #[tokio::test]
    async fn stop_unknown_port_is_false() {
        let mut l = launcher(LauncherConfig::default());
        assert!(!l.stop(8501).await.unwrap());
        l.shutdown().await.unwrap();
    }
}

//! Opening the assistant's web UI in the user's browser.

use tracing::{debug, warn};

/// Something that can show a URL to the user.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Opens URLs with the desktop's default handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        let mut cmd = opener_command(url);
        debug!(url, "Opening browser");
        // Dropped without waiting; tokio reaps the opener in the background.
        cmd.spawn().map(drop).inspect_err(|e| {
            warn!(url, error = %e, "Failed to launch browser opener");
        })
    }
}

#[cfg(target_os = "macos")]
fn opener_command(url: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("open");
    cmd.arg(url);
    cmd
}

#[cfg(windows)]
fn opener_command(url: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.args(["/C", "start", "", url]);
    cmd
}

#[cfg(all(unix, not(target_os = "macos")))]
fn opener_command(url: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("xdg-open");
    cmd.arg(url);
    cmd
}

/// Browser that never opens anything, for `--no-browser`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBrowser;

impl BrowserOpener for NoBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        debug!(url, "Browser opening disabled");
        Ok(())
    }
}

/// URL of the assistant UI on `port`.
pub fn local_url(port: u16) -> String {
    format!("http://localhost:{port}")
}

//! Desktop file access and launching URLs in the user's browser.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, bail};
use directories::{BaseDirs, UserDirs};
use tracing::{debug, warn};
use url::Url;

/// Files on the user's desktop, addressed by name.
#[derive(Debug, Clone)]
pub struct DesktopFiles {
    root: PathBuf,
}

impl DesktopFiles {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The platform desktop directory, or `~/Desktop` when none is registered.
    pub fn from_user_dirs() -> Result<Self> {
        if let Some(desktop) = UserDirs::new().and_then(|dirs| dirs.desktop_dir().map(PathBuf::from))
        {
            return Ok(Self::new(desktop));
        }
        let base = BaseDirs::new().context("Unable to resolve home directory")?;
        Ok(Self::new(base.home_dir().join("Desktop")))
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create (or truncate) an empty file.
    pub async fn create(&self, name: &str) -> Result<PathBuf> {
        let path = self.path_for(name);
        tokio::fs::write(&path, b"")
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(path)
    }

    /// File contents, or `None` when the file does not exist.
    pub async fn read(&self, name: &str) -> Result<Option<String>> {
        let path = self.path_for(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}

/// Hands a URL to something that can display it.
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Opens URLs with the platform's default handler.
#[derive(Debug, Clone, Default)]
pub struct SystemOpener;

impl SystemOpener {
    fn command_for(url: &str) -> Result<Command> {
        if cfg!(target_os = "windows") {
            let mut command = Command::new("cmd");
            command.args(["/C", "start", ""]).arg(url);
            return Ok(command);
        }
        let candidates: &[&str] = if cfg!(target_os = "macos") {
            &["open"]
        } else {
            &["xdg-open", "gio", "sensible-browser"]
        };
        for candidate in candidates {
            if let Ok(path) = which::which(candidate) {
                let mut command = Command::new(path);
                if *candidate == "gio" {
                    command.arg("open");
                }
                command.arg(url);
                return Ok(command);
            }
        }
        bail!("No URL handler found (tried {})", candidates.join(", "))
    }
}

impl UrlOpener for SystemOpener {
    fn open(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid URL {url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("Refusing to open non-web URL {url}");
        }
        let mut command = Self::command_for(parsed.as_str())?;
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to launch URL handler for {url}"))?;
        debug!(url, pid = child.id(), "launched URL handler");

        thread::spawn(move || {
            if let Err(err) = child.wait() {
                warn!(error = %err, "URL handler wait failed");
            }
        });
        Ok(())
    }
}

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, warn};

use crate::config::model::{PreviewConfig, ViewerConfig};

/// Non-fatal failure to produce a thumbnail; the browser shows a placeholder instead.
#[derive(Debug, thiserror::Error)]
pub enum RenderFailure {
    #[error("image not found: {0}")]
    MissingImage(PathBuf),
    #[error("thumbnail renderer '{0}' is not installed")]
    MissingRenderer(String),
    #[error("no thumbnail renderer configured")]
    NotConfigured,
    #[error("renderer exited with {status}: {stderr}")]
    Command { status: String, stderr: String },
    #[error("renderer produced no output")]
    Empty,
    #[error("failed to run renderer")]
    Io(#[from] io::Error),
}

pub trait ThumbnailRenderer: Send + Sync {
    /// Render `path` into terminal text that fits `width` x `height` cells.
    ///
    /// # Errors
    ///
    /// Returns a [`RenderFailure`] when the image or renderer is unavailable.
    fn render(&self, path: &Path, width: u16, height: u16) -> Result<String, RenderFailure>;
}

/// Runs an external renderer such as `chafa`, appending `--size WxH <path>`.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    argv: Vec<String>,
}

impl CommandRenderer {
    #[must_use]
    pub fn new(config: &PreviewConfig) -> Self {
        Self {
            argv: config.command.clone(),
        }
    }
}

impl ThumbnailRenderer for CommandRenderer {
    fn render(&self, path: &Path, width: u16, height: u16) -> Result<String, RenderFailure> {
        let (program, args) = self.argv.split_first().ok_or(RenderFailure::NotConfigured)?;
        if !path.exists() {
            return Err(RenderFailure::MissingImage(path.to_path_buf()));
        }
        let program_path =
            which::which(program).map_err(|_| RenderFailure::MissingRenderer(program.clone()))?;
        let output = Command::new(program_path)
            .args(args)
            .arg("--size")
            .arg(format!("{width}x{height}"))
            .arg(path)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(RenderFailure::Command {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let rendered = String::from_utf8_lossy(&output.stdout).into_owned();
        if rendered.trim().is_empty() {
            return Err(RenderFailure::Empty);
        }
        Ok(rendered)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("image not found: {0}")]
    MissingImage(PathBuf),
    #[error("no image viewer found; set viewer.command in config.toml")]
    NoViewer,
    #[error("failed to launch {program}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
}

pub trait Viewer: Send + Sync {
    /// Launch the viewer and return without waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns a [`ViewerError`] when no viewer can be started.
    fn open(&self, path: &Path) -> Result<(), ViewerError>;
}

/// Configured viewer command, falling back to `open` or `xdg-open`.
#[derive(Debug, Clone)]
pub struct SystemViewer {
    argv: Vec<String>,
}

impl SystemViewer {
    #[must_use]
    pub fn new(config: &ViewerConfig) -> Self {
        Self {
            argv: config.command.clone(),
        }
    }

    fn resolve(&self) -> Option<(String, Vec<String>)> {
        if let Some((program, args)) = self.argv.split_first() {
            return Some((program.clone(), args.to_vec()));
        }
        ["open", "xdg-open"]
            .into_iter()
            .find(|candidate| which::which(candidate).is_ok())
            .map(|program| (program.to_string(), Vec::new()))
    }
}

impl Viewer for SystemViewer {
    fn open(&self, path: &Path) -> Result<(), ViewerError> {
        if !path.exists() {
            return Err(ViewerError::MissingImage(path.to_path_buf()));
        }
        let (program, args) = self.resolve().ok_or(ViewerError::NoViewer)?;
        let mut child = Command::new(&program)
            .args(&args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ViewerError::Launch {
                program: program.clone(),
                source,
            })?;
        debug!(%program, path = %path.display(), "viewer launched");
        thread::spawn(move || {
            if let Err(err) = child.wait() {
                warn!(error = %err, "viewer process wait failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_image_is_a_render_failure() {
        let renderer = CommandRenderer {
            argv: vec!["chafa".into()],
        };
        let err = renderer
            .render(Path::new("/definitely/not/here.jpg"), 40, 20)
            .expect_err("missing image");
        assert!(matches!(err, RenderFailure::MissingImage(_)));
    }

    #[test]
    fn unconfigured_renderer_degrades() {
        let renderer = CommandRenderer { argv: Vec::new() };
        assert!(matches!(
            renderer.render(Path::new("x.jpg"), 1, 1),
            Err(RenderFailure::NotConfigured)
        ));
    }

    #[test]
    fn missing_renderer_binary_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("a.jpg");
        std::fs::write(&image, b"x").expect("write");
        let renderer = CommandRenderer {
            argv: vec!["nh-no-such-renderer".into()],
        };
        assert!(matches!(
            renderer.render(&image, 10, 5),
            Err(RenderFailure::MissingRenderer(_))
        ));
    }

    #[test]
    fn viewer_rejects_missing_files() {
        let viewer = SystemViewer {
            argv: vec!["true".into()],
        };
        assert!(matches!(
            viewer.open(Path::new("/nope.png")),
            Err(ViewerError::MissingImage(_))
        ));
    }
}

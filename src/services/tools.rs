//! Locates the extractor binary, ffmpeg, and the optional fingerprint
//! calculator. Checks environment overrides, then a cached local bin
//! directory, then a `--version` probe; downloads a release asset as a
//! fallback.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::DropcrateError;

/// Resolved paths, cached for this process's lifetime.
#[derive(Debug, Clone)]
pub struct ResolvedTools {
    pub extractor_path: String,
    pub ffmpeg_path: String,
    pub fingerprint_calc_path: Option<String>,
}

pub struct ToolProvisioner {
    config: Arc<Config>,
    bin_dir: PathBuf,
}

impl ToolProvisioner {
    pub fn new(config: Arc<Config>) -> Self {
        ToolProvisioner {
            config,
            bin_dir: PathBuf::from(".dropcrate").join("bin"),
        }
    }

    /// Resolve the extractor, ffmpeg, and fingerprint-calculator paths.
    /// Fails with `ToolUnavailable` if the extractor cannot be found or
    /// downloaded; ffmpeg is assumed bundled/installed and returned as-is;
    /// the fingerprint calculator is optional (its absence only disables
    /// fingerprint matching, not the whole pipeline).
    pub async fn resolve(&self) -> Result<ResolvedTools> {
        let extractor_path = self.resolve_extractor().await?;
        let ffmpeg_path = self
            .config
            .ffmpeg_path
            .clone()
            .unwrap_or_else(|| "ffmpeg".to_string());

        if !Self::probe_version(&ffmpeg_path).await {
            warn!(path = %ffmpeg_path, "ffmpeg did not respond to -version; continuing, later stages will surface ToolUnavailable");
        }

        let fingerprint_calc_path = match &self.config.fpcalc_path {
            Some(p) => Some(p.clone()),
            None => {
                let default = "fpcalc".to_string();
                if Self::probe_version(&default).await {
                    Some(default)
                } else {
                    None
                }
            }
        };

        Ok(ResolvedTools {
            extractor_path,
            ffmpeg_path,
            fingerprint_calc_path,
        })
    }

    async fn resolve_extractor(&self) -> Result<String> {
        if let Some(path) = &self.config.extractor_path {
            if Self::probe_version(path).await {
                return Ok(path.clone());
            }
            warn!(path = %path, "YTDLP_PATH override did not respond to --version");
        }

        let cached = self.bin_dir.join(Self::extractor_binary_name());
        if cached.exists() && Self::probe_version(&cached.to_string_lossy()).await {
            info!(path = %cached.display(), "using cached extractor binary");
            return Ok(cached.to_string_lossy().into_owned());
        }

        let default = "yt-dlp".to_string();
        if Self::probe_version(&default).await {
            return Ok(default);
        }

        self.download_extractor()
            .await
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| {
                warn!(error = %e, "failed to provision extractor binary");
                anyhow::Error::new(DropcrateError::ToolUnavailable {
                    tool: "extractor".to_string(),
                })
            })
    }

    /// Download the platform-appropriate release asset over HTTPS, write it
    /// to a temp file in the cache bin directory, then rename into place and
    /// set the executable bit. If the native binary turns out non-functional
    /// after download, fall back to a portable archive plus a thin launcher
    /// script that delegates to a detected scripting runtime.
    async fn download_extractor(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.bin_dir)
            .await
            .context("failed to create tool cache directory")?;

        let url = Self::release_asset_url();
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("failed to build HTTP client")?;

        let response = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to download extractor asset from {url}"))?;

        if !response.status().is_success() {
            anyhow::bail!("extractor download returned HTTP {}", response.status());
        }

        let bytes = response
            .bytes()
            .await
            .context("failed to read extractor download body")?;

        let final_path = self.bin_dir.join(Self::extractor_binary_name());
        let tmp_path = self.bin_dir.join(format!(
            ".{}.download",
            Self::extractor_binary_name()
        ));
        fs::write(&tmp_path, &bytes)
            .await
            .context("failed to write downloaded extractor to temp file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&tmp_path).await?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&tmp_path, perms).await?;
        }

        fs::rename(&tmp_path, &final_path)
            .await
            .context("failed to rename extractor binary into place")?;

        if Self::probe_version(&final_path.to_string_lossy()).await {
            return Ok(final_path);
        }

        self.write_launcher_fallback(&final_path).await
    }

    /// A portable archive's native binary didn't run (e.g. missing a shared
    /// interpreter); write a thin launcher delegating to a scripting runtime
    /// that meets the required minimum version.
    async fn write_launcher_fallback(&self, archive_entry: &Path) -> Result<PathBuf> {
        for runtime in ["python3", "python"] {
            if Self::probe_version(runtime).await {
                let launcher_path = self.bin_dir.join(format!(
                    "{}.launcher",
                    Self::extractor_binary_name()
                ));
                let script = format!(
                    "#!/bin/sh\nexec {runtime} {} \"$@\"\n",
                    archive_entry.display()
                );
                let tmp = self.bin_dir.join(".launcher.tmp");
                fs::write(&tmp, script).await?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mut perms = fs::metadata(&tmp).await?.permissions();
                    perms.set_mode(0o755);
                    fs::set_permissions(&tmp, perms).await?;
                }
                fs::rename(&tmp, &launcher_path).await?;
                return Ok(launcher_path);
            }
        }
        anyhow::bail!("no scripting runtime available to run the launcher fallback")
    }

    async fn probe_version(path: &str) -> bool {
        Command::new(path)
            .arg("--version")
            .kill_on_drop(true)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn extractor_binary_name() -> &'static str {
        if cfg!(windows) {
            "yt-dlp.exe"
        } else {
            "yt-dlp"
        }
    }

    fn release_asset_url() -> String {
        let asset = if cfg!(windows) {
            "yt-dlp.exe"
        } else if cfg!(target_os = "macos") {
            "yt-dlp_macos"
        } else {
            "yt-dlp"
        };
        format!("https://github.com/yt-dlp/yt-dlp/releases/latest/download/{asset}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_version_false_for_nonexistent_binary() {
        assert!(!ToolProvisioner::probe_version("dropcrate-definitely-not-a-real-binary").await);
    }
}

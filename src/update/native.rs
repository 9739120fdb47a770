//! Native package installer adapter
//!
//! Hands a verified installer to the operating system and takes the host
//! process down. Process and window control sits behind [`AppLifecycle`] so
//! the shell (and tests) decide what "close windows" and "exit" mean.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use super::manifest::{UpdateChannel, UpdateManifest};
use super::verify::VerifiedArtifact;
use crate::config::SettingsStore;
use crate::core::error::InstallError;
use crate::core::utils::get_extension;

/// User answer to the install prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallDecision {
    Confirm,
    Defer,
}

/// Host application hooks used around installation and relaunch
#[async_trait]
pub trait AppLifecycle: Send + Sync {
    /// Ask the user to install now or later
    async fn confirm_install(&self, manifest: &UpdateManifest) -> InstallDecision;

    /// Remove handlers that would veto process exit
    fn detach_shutdown_hooks(&self);

    fn close_windows(&self);

    fn spawn_installer(&self, command: &InstallerCommand) -> std::io::Result<()>;

    /// Start a fresh instance of the application
    fn relaunch(&self) -> std::io::Result<()>;

    fn exit(&self, code: i32);

    /// Reveal a path in the platform file manager
    fn open_path(&self, path: &Path) -> std::io::Result<()>;
}

/// How this copy of the application was installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Direct,
    MacAppStore,
    Snap,
    MicrosoftStore,
}

impl Distribution {
    /// Detect from the process environment
    pub fn detect() -> Self {
        Self::from_env(|key| std::env::var(key).ok())
    }

    pub fn from_env(var: impl Fn(&str) -> Option<String>) -> Self {
        if var("APP_SANDBOX_CONTAINER_ID").is_some() {
            Distribution::MacAppStore
        } else if var("SNAP").is_some() {
            Distribution::Snap
        } else if var("DESK_CHANNEL").as_deref() == Some("ms-store") {
            Distribution::MicrosoftStore
        } else {
            Distribution::Direct
        }
    }

    /// Store builds update through the store
    pub fn is_store(&self) -> bool {
        !matches!(self, Distribution::Direct)
    }

    /// Store builds are restarted by the store, never by us
    pub fn allows_relaunch(&self) -> bool {
        !self.is_store()
    }
}

/// Kind of OS installer an artifact needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerKind {
    Nsis,
    Msi,
    Dmg,
    Pkg,
    AppImage,
    Deb,
    Rpm,
}

impl InstallerKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        match get_extension(path).as_str() {
            "exe" => Some(InstallerKind::Nsis),
            "msi" => Some(InstallerKind::Msi),
            "dmg" => Some(InstallerKind::Dmg),
            "pkg" => Some(InstallerKind::Pkg),
            "appimage" => Some(InstallerKind::AppImage),
            "deb" => Some(InstallerKind::Deb),
            "rpm" => Some(InstallerKind::Rpm),
            _ => None,
        }
    }
}

/// Program and arguments that install an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerCommand {
    pub kind: InstallerKind,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl InstallerCommand {
    /// Build the invocation for `artifact`.
    ///
    /// `current_exe` is the AppImage being replaced; `script_dir` receives
    /// the swap script for that case.
    pub fn for_artifact(
        artifact: &Path,
        current_exe: &Path,
        script_dir: &Path,
    ) -> Result<Self, InstallError> {
        let kind = InstallerKind::from_path(artifact).ok_or_else(|| {
            InstallError::UnsupportedPackage {
                path: artifact.display().to_string(),
            }
        })?;
        let artifact_arg = artifact.display().to_string();

        let (program, args) = match kind {
            // Passive NSIS install, relaunching when done
            InstallerKind::Nsis => (artifact.to_path_buf(), vec!["/P".into(), "/R".into()]),
            InstallerKind::Msi => (
                PathBuf::from("msiexec"),
                vec!["/i".into(), artifact_arg, "/passive".into()],
            ),
            InstallerKind::Dmg | InstallerKind::Pkg => (PathBuf::from("open"), vec![artifact_arg]),
            InstallerKind::Deb | InstallerKind::Rpm => {
                (PathBuf::from("xdg-open"), vec![artifact_arg])
            }
            InstallerKind::AppImage => {
                let script = write_swap_script(current_exe, artifact, script_dir)?;
                (PathBuf::from("sh"), vec![script.display().to_string()])
            }
        };

        Ok(Self {
            kind,
            program,
            args,
        })
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// Script that waits for us to exit, swaps the AppImage and starts it
fn write_swap_script(current: &Path, new: &Path, script_dir: &Path) -> Result<PathBuf, InstallError> {
    std::fs::create_dir_all(script_dir)?;
    let script_path = script_dir.join("install-update.sh");
    let backup = current.with_extension("old");

    let script = format!(
        r#"#!/bin/sh
# Wait for the running instance to exit
sleep 2

if [ -f "{current}" ]; then
    mv "{current}" "{backup}" || exit 1
fi

if ! mv "{new}" "{current}"; then
    [ -f "{backup}" ] && mv "{backup}" "{current}"
    exit 1
fi

chmod +x "{current}"
rm -f "{backup}"
"{current}" &

rm -f "$0"
"#,
        current = current.display(),
        new = new.display(),
        backup = backup.display(),
    );

    std::fs::write(&script_path, &script)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms)?;
    }

    Ok(script_path)
}

/// Lifecycle backed by real processes; window hooks are no-ops
#[derive(Debug, Default)]
pub struct SystemLifecycle;

#[async_trait]
impl AppLifecycle for SystemLifecycle {
    async fn confirm_install(&self, _manifest: &UpdateManifest) -> InstallDecision {
        InstallDecision::Confirm
    }

    fn detach_shutdown_hooks(&self) {}

    fn close_windows(&self) {}

    fn spawn_installer(&self, command: &InstallerCommand) -> std::io::Result<()> {
        command.to_command().spawn().map(|_| ())
    }

    fn relaunch(&self) -> std::io::Result<()> {
        let exe = std::env::current_exe()?;
        Command::new(exe)
            .args(std::env::args_os().skip(1))
            .spawn()
            .map(|_| ())
    }

    fn exit(&self, code: i32) {
        std::process::exit(code);
    }

    fn open_path(&self, path: &Path) -> std::io::Result<()> {
        let opener = if cfg!(target_os = "windows") {
            "explorer"
        } else if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        };
        Command::new(opener).arg(path).spawn().map(|_| ())
    }
}

/// Tear down the UI and start a fresh instance after `delay`
pub async fn restart_application(
    lifecycle: &dyn AppLifecycle,
    distribution: Distribution,
    delay: Duration,
) -> Result<(), InstallError> {
    tracing::info!(delay_ms = delay.as_millis() as u64, ?distribution, "Restarting application");
    tokio::time::sleep(delay).await;

    lifecycle.detach_shutdown_hooks();
    lifecycle.close_windows();
    if distribution.allows_relaunch() {
        lifecycle.relaunch().map_err(|e| InstallError::LaunchFailed {
            reason: e.to_string(),
        })?;
    }
    lifecycle.exit(0);
    Ok(())
}

/// Result of handing a package to the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeInstallOutcome {
    /// Installer launched; the process is exiting
    Installed,
    /// User chose to install later
    Deferred,
}

/// Installs verified native packages
pub struct NativeInstaller {
    lifecycle: Arc<dyn AppLifecycle>,
    settings: Arc<SettingsStore>,
    distribution: Distribution,
    script_dir: PathBuf,
}

impl NativeInstaller {
    pub fn new(
        lifecycle: Arc<dyn AppLifecycle>,
        settings: Arc<SettingsStore>,
        distribution: Distribution,
        script_dir: PathBuf,
    ) -> Self {
        Self {
            lifecycle,
            settings,
            distribution,
            script_dir,
        }
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Prompt when the strategy asks for it, then launch the OS installer and exit.
    ///
    /// Silent and seamless updates skip the prompt; a forced update ignores a deferral.
    pub async fn install_native_package(
        &self,
        artifact: &VerifiedArtifact,
    ) -> Result<NativeInstallOutcome, InstallError> {
        if artifact.channel() != UpdateChannel::Native {
            return Err(InstallError::WrongChannel {
                expected: UpdateChannel::Native,
                actual: artifact.channel(),
            });
        }
        if self.distribution.is_store() {
            return Err(InstallError::StoreManaged);
        }

        let current_exe = std::env::current_exe()?;
        let command = InstallerCommand::for_artifact(artifact.path(), &current_exe, &self.script_dir)?;

        let manifest = artifact.manifest();
        let strategy = manifest.update_strategy;
        if strategy.shows_prompt()
            && self.lifecycle.confirm_install(manifest).await == InstallDecision::Defer
        {
            if !strategy.is_forced() {
                tracing::info!(version = %manifest.version, "Native install deferred");
                return Ok(NativeInstallOutcome::Deferred);
            }
            tracing::info!(version = %manifest.version, "Forced update cannot be deferred");
        }

        self.settings
            .set_update_build_number(manifest.build_number.clone())
            .await?;

        tracing::info!(
            version = %manifest.version,
            installer = ?command.kind,
            path = %artifact.path().display(),
            "Launching native installer"
        );

        self.lifecycle.detach_shutdown_hooks();
        self.lifecycle.close_windows();
        self.lifecycle
            .spawn_installer(&command)
            .map_err(|e| InstallError::LaunchFailed {
                reason: e.to_string(),
            })?;
        self.lifecycle.exit(0);

        Ok(NativeInstallOutcome::Installed)
    }

    /// Reveal the verified package so the user can install it by hand
    pub fn manual_install(&self, artifact: &VerifiedArtifact) -> Result<(), InstallError> {
        let dir = artifact.path().parent().unwrap_or(artifact.path());
        tracing::info!(dir = %dir.display(), "Opening package directory for manual install");
        self.lifecycle
            .open_path(dir)
            .map_err(|e| InstallError::LaunchFailed {
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_distribution_detection() {
        let env = |pairs: &[(&str, &str)]| {
            let map: HashMap<String, String> = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Distribution::from_env(move |key| map.get(key).cloned())
        };

        assert_eq!(env(&[]), Distribution::Direct);
        assert_eq!(env(&[("SNAP", "/snap/wallet/1")]), Distribution::Snap);
        assert_eq!(env(&[("DESK_CHANNEL", "ms-store")]), Distribution::MicrosoftStore);
        assert_eq!(env(&[("DESK_CHANNEL", "direct")]), Distribution::Direct);
        assert_eq!(
            env(&[("APP_SANDBOX_CONTAINER_ID", "so.wallet")]),
            Distribution::MacAppStore
        );
        assert!(Distribution::Snap.is_store());
        assert!(!Distribution::MacAppStore.allows_relaunch());
        assert!(Distribution::Direct.allows_relaunch());
    }

    #[test]
    fn test_installer_kind_from_path() {
        assert_eq!(InstallerKind::from_path(Path::new("5.1.0.exe")), Some(InstallerKind::Nsis));
        assert_eq!(
            InstallerKind::from_path(Path::new("5.1.0.AppImage")),
            Some(InstallerKind::AppImage)
        );
        assert_eq!(InstallerKind::from_path(Path::new("5.1.0.tar.gz")), None);
    }

    #[test]
    fn test_installer_commands() {
        let temp = TempDir::new().unwrap();
        let exe = Path::new("/opt/wallet/Wallet.AppImage");

        let nsis = InstallerCommand::for_artifact(Path::new("/tmp/5.1.0.exe"), exe, temp.path()).unwrap();
        assert_eq!(nsis.program, PathBuf::from("/tmp/5.1.0.exe"));
        assert_eq!(nsis.args, vec!["/P", "/R"]);

        let msi = InstallerCommand::for_artifact(Path::new("/tmp/5.1.0.msi"), exe, temp.path()).unwrap();
        assert_eq!(msi.program, PathBuf::from("msiexec"));
        assert_eq!(msi.args[0], "/i");

        let dmg = InstallerCommand::for_artifact(Path::new("/tmp/5.1.0.dmg"), exe, temp.path()).unwrap();
        assert_eq!(dmg.program, PathBuf::from("open"));

        let unknown = InstallerCommand::for_artifact(Path::new("/tmp/5.1.0.zip"), exe, temp.path());
        assert!(matches!(unknown, Err(InstallError::UnsupportedPackage { .. })));
    }

    #[test]
    fn test_appimage_swap_script() {
        let temp = TempDir::new().unwrap();
        let cmd = InstallerCommand::for_artifact(
            Path::new("/tmp/native/5.1.0.AppImage"),
            Path::new("/opt/wallet/Wallet.AppImage"),
            temp.path(),
        )
        .unwrap();
        assert_eq!(cmd.program, PathBuf::from("sh"));

        let script = std::fs::read_to_string(&cmd.args[0]).unwrap();
        assert!(script.contains("mv \"/tmp/native/5.1.0.AppImage\" \"/opt/wallet/Wallet.AppImage\""));
        assert!(script.contains("chmod +x"));
    }
}

//! Running an update's installer scripts from its mounted disk image.
//!
//! The image carries up to three scripts named after the configured prefix:
//! `<prefix>_preinstall` (optional), `<prefix>_install` (required) and
//! `<prefix>_postinstall` (optional). Each receives the mount point as its
//! only argument. Only the install script's exit code decides the outcome.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::action::{Action, ActionContext, PipeValue, Pipes};
use crate::command_runner::{self, CommandOutput, CommandRunner};
use crate::disk_image::DiskImageMounter;
use crate::error::EngineError;
use crate::logging::{rotate_logs, ScriptLogger};
use crate::stats::{self, StatKey, StatsCollection};
use crate::update_info::UpdateInfo;

pub const INSTALL_SUCCESS: i32 = 0;
pub const INSTALL_WANTS_REBOOT: i32 = 66;
pub const INSTALL_TRY_AGAIN_LATER: i32 = 77;

pub const DEFAULT_SCRIPT_PREFIX: &str = ".engine";

const SCRIPT_LOGS_KEPT: usize = 10;

/// Whether an install script exit code counts as success.
pub fn is_success_code(code: i32) -> bool {
    matches!(
        code,
        INSTALL_SUCCESS | INSTALL_WANTS_REBOOT | INSTALL_TRY_AGAIN_LATER
    )
}

/// Where scripts live and how images are mounted.
#[derive(Clone)]
pub struct InstallSettings {
    pub script_prefix: String,
    pub mounter: Arc<dyn DiskImageMounter>,
    pub script_log_dir: Option<PathBuf>,
}

/// Keeps an image mounted while its scripts run. The normal path awaits
/// [`release`](Self::release); dropping an unreleased guard (cancellation)
/// still detaches the image on the blocking pool.
struct MountGuard {
    mounter: Arc<dyn DiskImageMounter>,
    mount_point: Option<PathBuf>,
}

impl MountGuard {
    fn new(mounter: Arc<dyn DiskImageMounter>, mount_point: PathBuf) -> Self {
        Self {
            mounter,
            mount_point: Some(mount_point),
        }
    }

    async fn release(mut self) {
        let Some(mount_point) = self.mount_point.take() else {
            return;
        };
        let mounter = self.mounter.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || unmount(mounter.as_ref(), &mount_point)).await {
            tracing::warn!(error = %e, "unmount task failed");
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        let Some(mount_point) = self.mount_point.take() else {
            return;
        };
        let mounter = self.mounter.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || unmount(mounter.as_ref(), &mount_point));
            }
            Err(_) => unmount(mounter.as_ref(), &mount_point),
        }
    }
}

fn unmount(mounter: &dyn DiskImageMounter, mount_point: &Path) {
    if let Err(e) = mounter.unmount(mount_point) {
        tracing::warn!(mount_point = %mount_point.display(), error = %e, "unmount failed");
    }
}

pub struct InstallAction {
    name: String,
    pipes: Pipes,
    dmg_path: Option<PathBuf>,
    runner: Arc<dyn CommandRunner>,
    user_initiated: bool,
    update_info: UpdateInfo,
    settings: InstallSettings,
    stats: Option<Arc<StatsCollection>>,
    return_code: Option<i32>,
}

impl InstallAction {
    /// With `dmg_path` unset the image path is read from the input pipe.
    pub fn new(
        dmg_path: Option<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        user_initiated: bool,
        update_info: UpdateInfo,
        settings: InstallSettings,
    ) -> Self {
        Self {
            name: format!("install {}", update_info.product_id),
            pipes: Pipes::default(),
            dmg_path,
            runner,
            user_initiated,
            update_info,
            settings,
            stats: None,
            return_code: None,
        }
    }

    pub fn with_stats(mut self, stats: Option<Arc<StatsCollection>>) -> Self {
        self.stats = stats;
        self
    }

    pub fn update_info(&self) -> &UpdateInfo {
        &self.update_info
    }

    /// Exit code of the install script once it has run.
    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    fn script_path(&self, mount_point: &Path, script: &str) -> PathBuf {
        mount_point.join(format!("{}_{script}", self.settings.script_prefix))
    }

    fn environment(&self) -> Vec<(String, String)> {
        let mut env = self.update_info.environment();
        let flag = if self.user_initiated { "YES" } else { "NO" };
        env.push(("KS_USER_INITIATED".into(), flag.into()));
        env
    }

    fn log_script(&self, script: &str, output: &CommandOutput, success: bool) {
        let Some(dir) = &self.settings.script_log_dir else {
            return;
        };
        let product = &self.update_info.product_id;
        match ScriptLogger::new(dir, product, script) {
            Ok(mut log) => {
                log.write_line(&format!("exit code: {}", output.status));
                log.write_section("stdout", &output.stdout);
                log.write_section("stderr", &output.stderr);
                log.finish(success);
                rotate_logs(dir, product, script, SCRIPT_LOGS_KEPT);
            }
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "cannot write script log"),
        }
    }

    /// Run an optional hook through the injected runner. Failures are
    /// logged and otherwise ignored.
    async fn run_hook(
        &self,
        script: &str,
        mount_point: &Path,
        env: &[(String, String)],
    ) -> Option<CommandOutput> {
        let path = self.script_path(mount_point, script);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return None;
        }
        let args = [mount_point.display().to_string()];
        match self.runner.run(&path, &args, env).await {
            Ok(output) => {
                if !output.success() {
                    tracing::warn!(script, status = output.status, "hook script failed, continuing");
                }
                self.log_script(script, &output, output.success());
                Some(output)
            }
            Err(e) => {
                tracing::warn!(script, error = %e, "hook script could not run, continuing");
                None
            }
        }
    }

    async fn install(&mut self, dmg: &Path) -> Result<i32, EngineError> {
        let mounter = self.settings.mounter.clone();
        let image = dmg.to_path_buf();
        let mount_point = tokio::task::spawn_blocking(move || mounter.mount(&image))
            .await
            .map_err(|e| EngineError::DiskImage {
                path: dmg.display().to_string(),
                message: e.to_string(),
            })??;
        tracing::debug!(mount_point = %mount_point.display(), "disk image mounted");
        let guard = MountGuard::new(self.settings.mounter.clone(), mount_point.clone());
        let result = self.run_scripts(dmg, &mount_point).await;
        guard.release().await;
        result
    }

    async fn run_scripts(&mut self, dmg: &Path, mount_point: &Path) -> Result<i32, EngineError> {
        let mut env = self.environment();

        let pre = self.run_hook("preinstall", mount_point, &env).await;
        env.push((
            "KS_PREINSTALL_OUT".into(),
            pre.map(|o| o.stdout).unwrap_or_default(),
        ));

        let install = self.script_path(mount_point, "install");
        if !tokio::fs::try_exists(&install).await.unwrap_or(false) {
            return Err(EngineError::DiskImage {
                path: dmg.display().to_string(),
                message: format!("missing install script {}", install.display()),
            });
        }
        let args = [mount_point.display().to_string()];
        let output = command_runner::run_process(&install, &args, &env).await?;
        let code = output.status;
        self.log_script("install", &output, is_success_code(code));
        self.return_code = Some(code);
        self.pipes
            .output
            .set_contents(Some(PipeValue::ReturnCode(code)));
        tracing::info!(product_id = %self.update_info.product_id, code, "install script finished");

        env.push(("KS_INSTALL_OUT".into(), output.stdout));
        self.run_hook("postinstall", mount_point, &env).await;

        Ok(code)
    }
}

#[async_trait]
impl Action for InstallAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipes(&self) -> &Pipes {
        &self.pipes
    }

    fn pipes_mut(&mut self) -> &mut Pipes {
        &mut self.pipes
    }

    async fn perform(&mut self, _cx: &ActionContext) -> bool {
        let Some(dmg) = self.dmg_path.clone().or_else(|| self.pipes.input.path()) else {
            tracing::warn!(product_id = %self.update_info.product_id, "no disk image to install from");
            return false;
        };

        match self.install(&dmg).await {
            Ok(code) => {
                if let Some(stats) = &self.stats {
                    stats.set(
                        StatKey::product(self.update_info.product_id.clone(), stats::INSTALL_RC),
                        i64::from(code),
                    );
                }
                if !is_success_code(code) {
                    tracing::warn!(product_id = %self.update_info.product_id, code, "install failed");
                }
                is_success_code(code)
            }
            Err(e) => {
                tracing::warn!(
                    product_id = %self.update_info.product_id,
                    dmg = %dmg.display(),
                    error = %e,
                    "install failed"
                );
                false
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(all(test, unix))]
pub(crate) mod testing {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Mutex;

    use super::*;

    /// Write an executable shell script.
    pub fn script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Directory "mounts" that records every mount and unmount.
    #[derive(Default)]
    pub struct RecordingMounter {
        pub events: Mutex<Vec<String>>,
        pub unmount_threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl DiskImageMounter for RecordingMounter {
        fn mount(&self, image: &Path) -> Result<PathBuf, EngineError> {
            self.events.lock().unwrap().push("mount".into());
            crate::disk_image::DirectoryMounter.mount(image)
        }

        fn unmount(&self, _mount_point: &Path) -> Result<(), EngineError> {
            self.events.lock().unwrap().push("unmount".into());
            self.unmount_threads.lock().unwrap().push(std::thread::current().id());
            Ok(())
        }
    }

    impl RecordingMounter {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }
}

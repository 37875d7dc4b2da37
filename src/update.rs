use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::action::{Action, ActionContext, ActionPipe, CompositeAction, Pipes};
use crate::command_runner::CommandRunner;
use crate::download::DownloadAction;
use crate::engine::EngineContext;
use crate::install::{InstallAction, INSTALL_WANTS_REBOOT};
use crate::update_info::UpdateInfo;

/// Reported by [`UpdateAction::return_code`] when the install never ran.
pub const RETURN_CODE_NOT_RUN: i32 = -1;

/// `<dir>/<product id>/<file name of the codebase URL>`.
pub fn download_path(dir: &Path, info: &UpdateInfo) -> PathBuf {
    let path = info
        .codebase_url
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let name = path
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty() && *n != "..")
        .unwrap_or("update.dmg");
    let product = info.product_id.replace(['/', '\\'], "_");
    dir.join(product).join(name)
}

/// Download followed by install, as one fail-fast unit.
pub struct UpdateAction {
    composite: CompositeAction,
    update_info: UpdateInfo,
    install_out: ActionPipe,
}

impl UpdateAction {
    /// Bond `download`'s output path to `install`'s input.
    pub fn from_actions(
        update_info: UpdateInfo,
        mut download: DownloadAction,
        mut install: InstallAction,
    ) -> Self {
        ActionPipe::bond_new(&mut download, &mut install);
        let install_out = install.out_pipe().clone();
        let composite = CompositeAction::from_nonempty(
            format!("update {}", update_info.product_id),
            vec![Box::new(download), Box::new(install)],
        );
        Self {
            composite,
            update_info,
            install_out,
        }
    }

    /// Build the download and install steps from the engine's settings.
    pub fn for_engine(
        update_info: UpdateInfo,
        engine: &EngineContext,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let settings = engine.settings();
        let download = DownloadAction::new(
            update_info.codebase_url.clone(),
            update_info.size,
            update_info.hash.clone(),
            download_path(&settings.download_dir, &update_info),
            settings.fetcher.clone(),
        )
        .with_stats(engine.stats());
        let install = InstallAction::new(
            None,
            runner,
            engine.params().user_initiated,
            update_info.clone(),
            settings.install.clone(),
        )
        .with_stats(engine.stats());
        Self::from_actions(update_info, download, install)
    }

    pub fn update_info(&self) -> &UpdateInfo {
        &self.update_info
    }

    /// The install script's exit code, or [`RETURN_CODE_NOT_RUN`].
    pub fn return_code(&self) -> i32 {
        self.install_out.return_code().unwrap_or(RETURN_CODE_NOT_RUN)
    }

    /// Only meaningful once the update has finished.
    pub fn wants_reboot(&self) -> bool {
        self.return_code() == INSTALL_WANTS_REBOOT
    }

    pub fn composite(&self) -> &CompositeAction {
        &self.composite
    }
}

#[async_trait]
impl Action for UpdateAction {
    fn name(&self) -> &str {
        self.composite.name()
    }

    fn pipes(&self) -> &Pipes {
        self.composite.pipes()
    }

    fn pipes_mut(&mut self) -> &mut Pipes {
        self.composite.pipes_mut()
    }

    async fn perform(&mut self, cx: &ActionContext) -> bool {
        self.composite.perform(cx).await
    }

    fn terminate(&mut self) {
        self.composite.terminate();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_path_uses_product_and_url_file_name() {
        let info = UpdateInfo::new("com.example.app", "https://dl.example.com/a/App-2.0.dmg?sig=1", 1, "h");
        assert_eq!(
            download_path(Path::new("/cache"), &info),
            PathBuf::from("/cache/com.example.app/App-2.0.dmg")
        );

        let bare = UpdateInfo::new("app", "https://dl.example.com/", 1, "h");
        assert_eq!(
            download_path(Path::new("/cache"), &bare),
            PathBuf::from("/cache/app/update.dmg")
        );
    }

    #[cfg(unix)]
    mod scripted {
        use base64::Engine as _;
        use sha2::{Digest, Sha256};

        use super::*;
        use crate::action::ActionProcessor;
        use crate::command_runner::TaskCommandRunner;
        use crate::disk_image::DiskImageMounter;
        use crate::fetch::testing::FakeFetcher;
        use crate::install::testing::{script, RecordingMounter};
        use crate::install::{InstallSettings, DEFAULT_SCRIPT_PREFIX};

        /// The fake fetcher copies `payload` to the download path; the
        /// directory mounter then treats `image` as the mounted volume.
        async fn run_update(code: i32, fetch_ok: bool) -> (bool, i32, bool, Arc<RecordingMounter>) {
            let cache = tempfile::tempdir().unwrap();
            let image = tempfile::tempdir().unwrap();
            script(image.path(), ".engine_install", &format!("exit {code}"));

            let url = "https://dl.example.com/app.dmg";
            let payload = b"payload";
            let hash = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(payload));
            let fetcher = if fetch_ok {
                FakeFetcher::new().serve(url, payload.to_vec())
            } else {
                FakeFetcher::new().fail(url, "offline")
            };
            let info = UpdateInfo::new("app", url, payload.len() as u64, hash.clone());

            let download = DownloadAction::new(
                url,
                payload.len() as u64,
                hash,
                cache.path().join("app.dmg"),
                Arc::new(fetcher),
            );
            let mounter = Arc::new(RecordingMounter::default());
            let install = InstallAction::new(
                // Downloads are files, so point the install at the script
                // directory explicitly.
                Some(image.path().to_path_buf()),
                Arc::new(TaskCommandRunner),
                false,
                info.clone(),
                InstallSettings {
                    script_prefix: DEFAULT_SCRIPT_PREFIX.into(),
                    mounter: mounter.clone() as Arc<dyn DiskImageMounter>,
                    script_log_dir: None,
                },
            );
            let update = UpdateAction::from_actions(info, download, install);

            let processor = ActionProcessor::new();
            processor.enqueue_action(Box::new(update));
            processor.start_processing().await;
            let finished = processor.take_finished();
            let update = finished[0].action.as_any().downcast_ref::<UpdateAction>().unwrap();
            (
                finished[0].successful,
                update.return_code(),
                update.wants_reboot(),
                mounter,
            )
        }

        #[tokio::test]
        async fn reboot_code_is_a_successful_update_wanting_reboot() {
            let (ok, code, reboot, mounter) = run_update(66, true).await;
            assert!(ok);
            assert_eq!(code, 66);
            assert!(reboot);
            assert_eq!(mounter.events(), vec!["mount", "unmount"]);
        }

        #[tokio::test]
        async fn plain_failure_code_fails_the_update() {
            let (ok, code, reboot, mounter) = run_update(5, true).await;
            assert!(!ok);
            assert_eq!(code, 5);
            assert!(!reboot);
            assert_eq!(mounter.events(), vec!["mount", "unmount"]);
        }

        #[tokio::test]
        async fn failed_download_never_installs() {
            let (ok, code, _, mounter) = run_update(0, false).await;
            assert!(!ok);
            assert_eq!(code, RETURN_CODE_NOT_RUN);
            assert!(mounter.events().is_empty());
        }
    }
}

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use burnwatch_shared::{BurnwatchError, PipelineObserver, Result};
use serde::Serialize;
use tracing::instrument;

use crate::store::{FileStore, FolderRef, RemoteFile};

/// What to mirror and where.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Remote folder searched before the root container.
    pub folder_name: String,
    pub local_dir: PathBuf,
    /// Only names starting with this are mirrored. Empty matches everything.
    pub prefix: String,
    /// Count would-be downloads without writing anything.
    pub dry_run: bool,
}

/// Counts from one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Distinct non-folder files seen remotely.
    pub listed: usize,
    /// Files whose name matched the prefix.
    pub matched: usize,
    /// Files newly downloaded (or that would be, in dry-run mode).
    pub downloaded: usize,
    /// Files already present locally.
    pub skipped_existing: usize,
    /// Files whose name is not a plain file name and was refused.
    pub skipped_unsafe: usize,
}

/// Mirrors prefixed files from a [`FileStore`] into a local directory.
pub struct Synchronizer {
    store: Arc<dyn FileStore>,
}

/// Local file name for a remote name: `.tif` is appended unless the name
/// already ends in `.tif` or `.tiff`.
pub(crate) fn local_name(remote: &str) -> String {
    let lower = remote.to_ascii_lowercase();
    if lower.ends_with(".tif") || lower.ends_with(".tiff") {
        remote.to_string()
    } else {
        format!("{remote}.tif")
    }
}

/// A remote name is usable only as a single plain path component.
pub(crate) fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

impl Synchronizer {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self { store }
    }

    /// List the named folder (when it exists) and the root container, and
    /// download every prefixed file that is not yet present locally.
    ///
    /// Presence is judged by file name only. Re-running against an
    /// unchanged remote downloads nothing.
    #[instrument(skip_all, fields(folder = %request.folder_name, dry_run = request.dry_run))]
    pub async fn sync(
        &self,
        request: &SyncRequest,
        observer: &dyn PipelineObserver,
    ) -> Result<SyncReport> {
        let local_dir = &request.local_dir;
        std::fs::create_dir_all(local_dir).map_err(|e| BurnwatchError::io(local_dir, e))?;

        let mut containers = Vec::with_capacity(2);
        match self.store.find_folder(&request.folder_name).await? {
            Some(id) => containers.push(FolderRef::Id(id)),
            None => tracing::info!("remote folder not found, scanning root only"),
        }
        containers.push(FolderRef::Root);

        let mut files: Vec<RemoteFile> = Vec::new();
        let mut seen_ids = HashSet::new();
        for container in &containers {
            for file in self.store.list_files(container).await? {
                if !file.is_folder() && seen_ids.insert(file.id.clone()) {
                    files.push(file);
                }
            }
        }

        let mut report = SyncReport {
            listed: files.len(),
            ..SyncReport::default()
        };
        let matched: Vec<&RemoteFile> = files
            .iter()
            .filter(|f| f.name.starts_with(&request.prefix))
            .collect();
        report.matched = matched.len();

        let mut claimed_names = HashSet::new();
        for (i, file) in matched.iter().enumerate() {
            let name = local_name(&file.name);
            observer.progress(i + 1, matched.len(), &name);
            if !is_plain_name(&name) {
                observer.warning(&format!("refusing remote file with unsafe name {:?}", file.name));
                report.skipped_unsafe += 1;
                continue;
            }
            let dest = local_dir.join(&name);

            if dest.exists() || !claimed_names.insert(name.clone()) {
                report.skipped_existing += 1;
                continue;
            }

            if request.dry_run {
                tracing::info!(file = %name, "would download");
            } else {
                tracing::info!(file = %name, dest = %dest.display(), "downloading");
                self.download_atomic(file, &dest).await?;
            }
            report.downloaded += 1;
        }

        tracing::info!(
            listed = report.listed,
            matched = report.matched,
            downloaded = report.downloaded,
            unsafe_names = report.skipped_unsafe,
            "sync finished"
        );
        Ok(report)
    }

    /// Download into a sibling `.part` file, then rename into place.
    async fn download_atomic(&self, file: &RemoteFile, dest: &Path) -> Result<()> {
        let mut partial = dest.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        if let Err(e) = self.store.download(file, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| BurnwatchError::io(dest, e))
    }
}

use std::path::Path;

use async_trait::async_trait;
use burnwatch_shared::Result;

/// MIME type the file store uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Container whose direct children are listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderRef {
    /// The account's root container.
    Root,
    /// A folder by id.
    Id(String),
}

/// A file listed by the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Ids of the containing folders.
    pub parents: Vec<String>,
}

impl RemoteFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

/// Remote keyed file lister and downloader.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Id of the first folder named `name`, if any.
    async fn find_folder(&self, name: &str) -> Result<Option<String>>;

    /// Non-trashed direct children of `folder`.
    async fn list_files(&self, folder: &FolderRef) -> Result<Vec<RemoteFile>>;

    /// Download `file` to `dest`.
    async fn download(&self, file: &RemoteFile, dest: &Path) -> Result<()>;
}

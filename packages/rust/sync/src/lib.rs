//! Mirrors exported tiles from the cloud file store into the local raw directory.
//!
//! The remote side sits behind the [`FileStore`] trait; [`DriveFileStore`]
//! implements it over the Google Drive v3 REST API.

mod drive;
mod store;
mod synchronizer;

pub use drive::DriveFileStore;
pub use store::{FOLDER_MIME_TYPE, FileStore, FolderRef, RemoteFile};
pub use synchronizer::{SyncReport, SyncRequest, Synchronizer};

//! Google Drive v3 REST client.

use std::path::Path;

use async_trait::async_trait;
use burnwatch_shared::{AppConfig, BurnwatchError, Result, read_secret_env};
use reqwest::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::store::{FOLDER_MIME_TYPE, FileStore, FolderRef, RemoteFile};

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const PAGE_SIZE: &str = "1000";
const USER_AGENT: &str = concat!("burnwatch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
}

/// Escape a value for use inside a single-quoted Drive query literal.
fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// [`FileStore`] backed by the Google Drive v3 API.
pub struct DriveFileStore {
    client: Client,
    base_url: Url,
    token: String,
}

impl DriveFileStore {
    pub fn new(base_url: Url, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| BurnwatchError::remote(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    /// Build a client from the `[drive]` section; the token comes from the
    /// configured environment variable.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let token = read_secret_env(&config.drive.token_env)?;
        Self::new(config.drive.endpoint()?, token)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| BurnwatchError::config(format!("invalid drive path '{path}': {e}")))
    }

    async fn get(&self, url: Url, query: &[(&str, &str)], what: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BurnwatchError::remote(format!("{what}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BurnwatchError::remote(format!(
                "{what}: HTTP {status}: {}",
                body.trim()
            )));
        }
        Ok(response)
    }

    /// Run a `files.list` query, following page tokens.
    async fn query_files(&self, q: &str, what: &str) -> Result<Vec<DriveFile>> {
        let url = self.endpoint("drive/v3/files")?;
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", q),
                ("fields", "nextPageToken,files(id,name,mimeType,parents)"),
                ("pageSize", PAGE_SIZE),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }

            let page: FileList = self
                .get(url.clone(), &params, what)
                .await?
                .json()
                .await
                .map_err(|e| BurnwatchError::remote(format!("{what}: invalid response: {e}")))?;
            files.extend(page.files);

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl FileStore for DriveFileStore {
    async fn find_folder(&self, name: &str) -> Result<Option<String>> {
        let q = format!(
            "name = '{}' and mimeType = '{FOLDER_MIME_TYPE}' and trashed = false",
            quote(name)
        );
        let folders = self.query_files(&q, "find folder").await?;
        Ok(folders.into_iter().next().map(|f| f.id))
    }

    async fn list_files(&self, folder: &FolderRef) -> Result<Vec<RemoteFile>> {
        let parent = match folder {
            FolderRef::Root => "root".to_string(),
            FolderRef::Id(id) => quote(id),
        };
        let q = format!(
            "'{parent}' in parents and trashed = false and mimeType != '{FOLDER_MIME_TYPE}'"
        );
        let files = self.query_files(&q, "list files").await?;
        Ok(files
            .into_iter()
            .map(|f| RemoteFile {
                id: f.id,
                name: f.name,
                mime_type: f.mime_type,
                parents: f.parents,
            })
            .collect())
    }

    /// Streams the media body chunk by chunk into `dest`.
    async fn download(&self, file: &RemoteFile, dest: &Path) -> Result<()> {
        let url = self.endpoint(&format!("drive/v3/files/{}", file.id))?;
        let mut response = self.get(url, &[("alt", "media")], "download").await?;

        let mut out = tokio::fs::File::create(dest)
            .await
            .map_err(|e| BurnwatchError::io(dest, e))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BurnwatchError::remote(format!("download {}: {e}", file.name)))?
        {
            out.write_all(&chunk)
                .await
                .map_err(|e| BurnwatchError::io(dest, e))?;
            written += chunk.len() as u64;
        }
        out.flush().await.map_err(|e| BurnwatchError::io(dest, e))?;
        tracing::debug!(file = %file.name, bytes = written, "download complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> DriveFileStore {
        DriveFileStore::new(Url::parse(&server.uri()).unwrap(), "drive-token").unwrap()
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(quote("Burn's folder"), "Burn\\'s folder");
    }

    #[tokio::test]
    async fn find_folder_returns_first_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(header("authorization", "Bearer drive-token"))
            .and(query_param(
                "q",
                "name = 'VigiAI' and mimeType = 'application/vnd.google-apps.folder' and trashed = false",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [
                    { "id": "f1", "name": "VigiAI", "mimeType": FOLDER_MIME_TYPE },
                    { "id": "f2", "name": "VigiAI", "mimeType": FOLDER_MIME_TYPE }
                ]
            })))
            .mount(&server)
            .await;

        let id = store(&server).find_folder("VigiAI").await.unwrap();
        assert_eq!(id.as_deref(), Some("f1"));
    }

    #[tokio::test]
    async fn list_files_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("pageToken", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{ "id": "2", "name": "tile_0001.tif", "mimeType": "image/tiff" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{ "id": "1", "name": "tile_0000.tif", "mimeType": "image/tiff" }],
                "nextPageToken": "next"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let files = store(&server).list_files(&FolderRef::Root).await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["tile_0000.tif", "tile_0001.tif"]);
    }

    #[tokio::test]
    async fn download_writes_media() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/abc"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"II*\0raster".to_vec()))
            .mount(&server)
            .await;

        let dest = std::env::temp_dir().join(format!("burnwatch_drive_{}.tif", Uuid::now_v7()));
        let file = RemoteFile {
            id: "abc".into(),
            name: "tile_0000.tif".into(),
            mime_type: "image/tiff".into(),
            parents: vec!["root".into()],
        };
        store(&server).download(&file, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"II*\0raster");
        let _ = std::fs::remove_file(&dest);
    }

    #[tokio::test]
    async fn large_download_is_written_whole() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/big"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dest = std::env::temp_dir().join(format!("burnwatch_drive_{}.tif", Uuid::now_v7()));
        let file = RemoteFile {
            id: "big".into(),
            name: "tile_mosaic.tif".into(),
            mime_type: "image/tiff".into(),
            parents: Vec::new(),
        };
        store(&server).download(&file, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        let _ = std::fs::remove_file(&dest);
    }

    #[tokio::test]
    async fn unauthorized_is_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = store(&server).find_folder("VigiAI").await.unwrap_err();
        assert!(matches!(err, BurnwatchError::Remote(_)));
    }
}

//! Earth Engine REST client.
//!
//! Searches use `projects/earthengine-public/assets/<collection>:listImages`,
//! exports go through `projects/<project>/image:export`, and export jobs are
//! long-running operations polled by name.

use async_trait::async_trait;
use burnwatch_shared::{AppConfig, BurnwatchError, JobState, Result, read_secret_env};
use chrono::{NaiveDate, NaiveTime};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::catalog::{CatalogImage, CatalogQuery, ExportRequest, ExportSource, ImageryCatalog};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const USER_AGENT: &str = concat!("burnwatch/", env!("CARGO_PKG_VERSION"));
const CLOUD_PROPERTY: &str = "CLOUDY_PIXEL_PERCENTAGE";
const PUBLIC_CATALOG_PROJECT: &str = "earthengine-public";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListImagesResponse {
    #[serde(default)]
    images: Vec<ImageEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    id: String,
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    metadata: Option<OperationMetadata>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OperationMetadata {
    #[serde(default)]
    state: Option<String>,
}

impl Operation {
    /// Terminal metadata states win over `error`: cancelled operations
    /// report both.
    fn job_state(&self) -> JobState {
        let state = self.metadata.as_ref().and_then(|m| m.state.as_deref());
        match state {
            Some("SUCCEEDED") => JobState::Completed,
            Some("FAILED") => JobState::Failed,
            Some("CANCELLED") => JobState::Cancelled,
            _ if self.error.is_some() => JobState::Failed,
            Some("RUNNING" | "CANCELLING") => JobState::Running,
            _ if self.done => JobState::Completed,
            _ => JobState::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`ImageryCatalog`] backed by the Earth Engine REST API.
pub struct EarthEngineCatalog {
    client: Client,
    base_url: Url,
    project: String,
    token: String,
}

impl EarthEngineCatalog {
    pub fn new(base_url: Url, project: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| BurnwatchError::remote(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            project: project.into(),
            token: token.into(),
        })
    }

    /// Build a client from the `[catalog]` section. Credentials are read from
    /// the configured environment variables before any request is made.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let catalog = &config.catalog;
        let project = read_secret_env(&catalog.project_env)?;
        let token = read_secret_env(&catalog.token_env)?;
        Self::new(catalog.endpoint()?, project, token)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| BurnwatchError::config(format!("invalid catalog path '{path}': {e}")))
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
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
}

#[async_trait]
impl ImageryCatalog for EarthEngineCatalog {
    async fn list_images(&self, query: &CatalogQuery) -> Result<Vec<CatalogImage>> {
        let url = self.endpoint(&format!(
            "v1/projects/{PUBLIC_CATALOG_PROJECT}/assets/{}:listImages",
            query.collection
        ))?;
        let region = serde_json::to_string(query.region.to_geojson())
            .map_err(|e| BurnwatchError::config(e.to_string()))?;
        let filter = format!("{CLOUD_PROPERTY} <= {}", query.max_cloud_pct);

        let mut images = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("startTime", day_start(query.start)),
                ("endTime", day_start(query.end)),
                ("region", region.clone()),
                ("filter", filter.clone()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let response = self
                .send(self.client.get(url.clone()).query(&params), "listImages")
                .await?;
            let page: ListImagesResponse = response
                .json()
                .await
                .map_err(|e| BurnwatchError::remote(format!("listImages: invalid response: {e}")))?;

            images.extend(page.images.into_iter().map(|entry| CatalogImage {
                cloud_cover: entry
                    .properties
                    .get(CLOUD_PROPERTY)
                    .and_then(Value::as_f64)
                    .unwrap_or(100.0),
                id: entry.id,
            }));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        tracing::debug!(images = images.len(), "catalog search finished");
        Ok(images)
    }

    async fn submit_export(&self, request: &ExportRequest) -> Result<String> {
        let url = self.endpoint(&format!("v1/projects/{}/image:export", self.project))?;
        let body = export_body(request);

        let response = self
            .send(self.client.post(url).json(&body), "image:export")
            .await?;
        let operation: Operation = response
            .json()
            .await
            .map_err(|e| BurnwatchError::remote(format!("image:export: invalid response: {e}")))?;
        Ok(operation.name)
    }

    async fn job_state(&self, job_id: &str) -> Result<JobState> {
        let url = self.endpoint(&format!("v1/{job_id}"))?;
        let response = self.send(self.client.get(url), "operation status").await?;
        let operation: Operation = response
            .json()
            .await
            .map_err(|e| BurnwatchError::remote(format!("operation status: invalid response: {e}")))?;
        Ok(operation.job_state())
    }
}

// ---------------------------------------------------------------------------
// Expression graph
// ---------------------------------------------------------------------------

fn day_start(date: NaiveDate) -> String {
    format!("{}Z", date.and_time(NaiveTime::MIN).format("%Y-%m-%dT%H:%M:%S"))
}

fn constant(value: Value) -> Value {
    json!({ "constantValue": value })
}

fn invoke(function: &str, arguments: Value) -> Value {
    json!({ "functionInvocationValue": { "functionName": function, "arguments": arguments } })
}

fn source_image(source: &ExportSource, region: &Value) -> Value {
    match source {
        ExportSource::Image { id } => invoke("Image.load", json!({ "id": constant(json!(id)) })),
        ExportSource::MedianComposite { query } => {
            let collection = invoke(
                "ImageCollection.load",
                json!({ "id": constant(json!(query.collection)) }),
            );
            let by_date = invoke(
                "Collection.filter",
                json!({
                    "collection": collection,
                    "filter": invoke("Filter.dateRangeContains", json!({
                        "leftValue": invoke("DateRange", json!({
                            "start": constant(json!(day_start(query.start))),
                            "end": constant(json!(day_start(query.end))),
                        })),
                        "rightField": constant(json!("system:time_start")),
                    })),
                }),
            );
            let by_region = invoke(
                "Collection.filter",
                json!({
                    "collection": by_date,
                    "filter": invoke("Filter.intersects", json!({
                        "leftField": constant(json!(".all")),
                        "rightValue": region.clone(),
                    })),
                }),
            );
            let by_cloud = invoke(
                "Collection.filter",
                json!({
                    "collection": by_region,
                    "filter": invoke("Filter.lessThanOrEquals", json!({
                        "leftField": constant(json!(CLOUD_PROPERTY)),
                        "rightValue": constant(json!(query.max_cloud_pct)),
                    })),
                }),
            );
            invoke("reduce.median", json!({ "collection": by_cloud }))
        }
    }
}

/// Request body for `image:export`.
fn export_body(request: &ExportRequest) -> Value {
    let region = invoke(
        "GeometryConstructors.Polygon",
        json!({
            "coordinates": constant(request.region.to_geojson()["coordinates"].clone()),
            "geodesic": constant(json!(false)),
        }),
    );

    let selected = invoke(
        "Image.select",
        json!({
            "input": source_image(&request.source, &region),
            "bandSelectors": constant(json!(request.bands)),
        }),
    );
    let clipped = invoke(
        "Image.clip",
        json!({ "input": selected, "geometry": region.clone() }),
    );
    let cast = invoke("Image.toInt16", json!({ "value": clipped }));
    let scaled = invoke(
        "Image.clipToBoundsAndScale",
        json!({
            "input": cast,
            "geometry": region,
            "scale": constant(json!(request.scale_m)),
        }),
    );

    json!({
        "expression": { "result": "0", "values": { "0": scaled } },
        "description": request.description,
        "maxPixels": request.max_pixels.to_string(),
        "grid": { "crsCode": request.crs },
        "fileExportOptions": {
            "fileFormat": "GEO_TIFF",
            "geoTiffOptions": { "cloudOptimized": true },
            "driveDestination": {
                "folder": request.folder,
                "filenamePrefix": request.file_name_prefix,
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ExportSettings;
    use burnwatch_shared::AreaOfInterest;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query() -> CatalogQuery {
        CatalogQuery {
            collection: "COPERNICUS/S2_SR_HARMONIZED".into(),
            start: NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 8, 31).unwrap(),
            region: AreaOfInterest::from_bbox(&[-60.5, -3.5, -59.5, -2.5]).unwrap(),
            max_cloud_pct: 80.0,
        }
    }

    fn client(server: &MockServer) -> EarthEngineCatalog {
        EarthEngineCatalog::new(Url::parse(&server.uri()).unwrap(), "my-project", "secret").unwrap()
    }

    #[tokio::test]
    async fn list_images_follows_pages() {
        let server = MockServer::start().await;
        let list_path = "/v1/projects/earthengine-public/assets/COPERNICUS/S2_SR_HARMONIZED:listImages";

        Mock::given(method("GET"))
            .and(path(list_path))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "images": [{ "id": "S2/b", "properties": { "CLOUDY_PIXEL_PERCENTAGE": 4.5 } }]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(list_path))
            .and(header("authorization", "Bearer secret"))
            .and(query_param("filter", "CLOUDY_PIXEL_PERCENTAGE <= 80"))
            .and(query_param("startTime", "2024-08-01T00:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "images": [{ "id": "S2/a", "properties": { "CLOUDY_PIXEL_PERCENTAGE": 12.0 } }],
                "nextPageToken": "p2"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let images = client(&server).list_images(&query()).await.unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].id, "S2/a");
        assert_eq!(images[1].cloud_cover, 4.5);
    }

    #[tokio::test]
    async fn export_posts_expression_and_returns_operation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/my-project/image:export"))
            .and(body_partial_json(json!({
                "description": "tile_0000",
                "fileExportOptions": {
                    "fileFormat": "GEO_TIFF",
                    "driveDestination": { "folder": "VigiAI", "filenamePrefix": "tile_0000" }
                },
                "grid": { "crsCode": "EPSG:4326" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/my-project/operations/ABC123",
                "metadata": { "state": "PENDING" }
            })))
            .mount(&server)
            .await;

        let settings = ExportSettings {
            bands: ["B4".into(), "B8".into()],
            folder: "VigiAI".into(),
            scale_m: 20,
            prefix: "tile_".into(),
        };
        let q = query();
        let request = settings.request(
            ExportSource::Image { id: "S2/a".into() },
            &q.region,
            "tile_0000".into(),
        );

        let id = client(&server).submit_export(&request).await.unwrap();
        assert_eq!(id, "projects/my-project/operations/ABC123");
    }

    #[tokio::test]
    async fn operation_states_are_mapped() {
        let server = MockServer::start().await;
        let cases = [
            ("op1", json!({ "name": "op1", "metadata": { "state": "CANCELLING" } }), JobState::Running),
            ("op2", json!({ "name": "op2", "done": true, "metadata": { "state": "SUCCEEDED" } }), JobState::Completed),
            ("op3", json!({ "name": "op3", "done": true, "error": { "code": 3 } }), JobState::Failed),
            ("op4", json!({ "name": "op4", "metadata": { "state": "PENDING" } }), JobState::Pending),
            (
                "op5",
                json!({ "name": "op5", "done": true, "error": { "code": 1, "message": "Cancelled." }, "metadata": { "state": "CANCELLED" } }),
                JobState::Cancelled,
            ),
            (
                "op6",
                json!({ "name": "op6", "done": true, "error": { "code": 13 }, "metadata": { "state": "RUNNING" } }),
                JobState::Failed,
            ),
        ];
        for (name, body, _) in &cases {
            Mock::given(method("GET"))
                .and(path(format!("/v1/projects/my-project/operations/{name}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
                .mount(&server)
                .await;
        }

        let catalog = client(&server);
        for (name, _, expected) in cases {
            let state = catalog
                .job_state(&format!("projects/my-project/operations/{name}"))
                .await
                .unwrap();
            assert_eq!(state, expected, "operation {name}");
        }
    }

    #[tokio::test]
    async fn http_errors_are_remote_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&server)
            .await;

        let err = client(&server).list_images(&query()).await.unwrap_err();
        assert!(matches!(err, BurnwatchError::Remote(_)));
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn mosaic_expression_reduces_by_median() {
        let settings = ExportSettings {
            bands: ["B4".into(), "B8".into()],
            folder: "VigiAI".into(),
            scale_m: 20,
            prefix: "tile_".into(),
        };
        let q = query();
        let request = settings.request(
            ExportSource::MedianComposite { query: q.clone() },
            &q.region,
            "tile_mosaic".into(),
        );
        let body = export_body(&request).to_string();
        assert!(body.contains("reduce.median"));
        assert!(body.contains("Image.toInt16"));
        assert!(body.contains("CLOUDY_PIXEL_PERCENTAGE"));
    }

    #[test]
    fn missing_credentials_fail_before_any_request() {
        let mut config = AppConfig::default();
        config.catalog.project_env = "BURNWATCH_TEST_NO_PROJECT_4711".into();
        let err = match EarthEngineCatalog::from_config(&config) {
            Err(e) => e,
            Ok(_) => panic!("expected a config error"),
        };
        assert!(err.is_config());
    }
}

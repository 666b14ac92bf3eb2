//! Acquisition of raw tiles from a remote imagery catalog.
//!
//! The [`JobManager`] selects candidate images, submits one export job per
//! tile (or a single median mosaic job) and polls the jobs until they reach a
//! terminal state. The catalog itself sits behind the [`ImageryCatalog`]
//! trait; [`EarthEngineCatalog`] talks to the Earth Engine REST API.

mod catalog;
mod earthengine;
mod manager;

pub use catalog::{
    CatalogImage, CatalogQuery, ExportRequest, ExportSettings, ExportSource, ImageryCatalog,
    MosaicRequest, TileRequest,
};
pub use earthengine::EarthEngineCatalog;
pub use manager::{JobManager, JobProgress};

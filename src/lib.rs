//! A small Rust client for the Copernicus Data Space Ecosystem (CDSE).
//!
//! This crate implements the usual CDSE flow:
//! search the OData catalog for Sentinel products, then download the matches.
//!
//! ## Quick start
//! - Configure credentials via environment variables (`COPERNICUS_USERNAME`,
//!   `COPERNICUS_PASSWORD`) or a `.cdserc` / `.env` file (supported in the
//!   current directory and in your home directory).
//! - Build [`SearchParameters`], call [`Client::query`], then
//!   [`Client::download_all`].
//!
//! ```no_run
//! use cdse::{Client, Mission, SearchParameters};
//!
//! fn main() -> cdse::Result<()> {
//!     let client = Client::from_env()?;
//!     let footprint = cdse::geometry::to_wkt("area.geojson")?;
//!     let params = SearchParameters::between("2024-03-01", "2024-03-31")?
//!         .with_mission(Mission::Sentinel1)
//!         .with_product_type("GRD")
//!         .with_footprint(footprint)
//!         .with_filter("orbitDirection", "ASCENDING")
//!         .with_limit(10);
//!
//!     let products = client.query(&params)?;
//!     let report = client.download_all(&products, "downloads");
//!     for item in report.failures() {
//!         eprintln!("{}: {:?}", item.name, item.result);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! For full usage and configuration details, see the crate README.

#![forbid(unsafe_code)]

mod auth;
mod catalog;
mod client;
mod config;
mod download;
mod error;
pub mod geometry;
mod http;
mod product;
mod query;
mod util;

pub use auth::{AuthToken, TokenProvider};
pub use catalog::Catalog;
pub use client::Client;
pub use config::{
    BaseUrls, ClientConfig, Credentials, DEFAULT_CATALOG_URL, DEFAULT_CLIENT_ID, DEFAULT_DOWNLOAD_URL,
    DEFAULT_IDENTITY_URL, DEFAULT_PAGE_SIZE,
};
pub use download::{CancelToken, DownloadItem, DownloadOutcome, DownloadReport, Downloader};
pub use error::{DownloadError, DownloadErrorKind, Error, Result};
pub use product::{Checksum, ContentDate, ProductDescriptor, filter_by_attributes};
pub use query::{
    AttributeFilters, AttributeValue, FilterValue, Mission, Ordering, QuerySpec, SearchParameters,
    parse_timestamp,
};

use std::path::Path;
use std::sync::Arc;

use crate::auth::TokenProvider;
use crate::catalog::Catalog;
use crate::config::{ClientConfig, load_config};
use crate::download::{CancelToken, DownloadOutcome, DownloadReport, Downloader};
use crate::error::{DownloadError, Result};
use crate::http::Transport;
use crate::product::ProductDescriptor;
use crate::query::SearchParameters;

/// Entry point: one configuration, one token cache, one HTTP connection pool
/// shared by searches and downloads.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
    auth: Arc<TokenProvider>,
    catalog: Catalog,
    downloader: Downloader,
}

impl Client {
    /// Creates a client from environment variables and/or an rc file.
    ///
    /// This is equivalent to `Client::new(None, None)`.
    pub fn from_env() -> Result<Self> {
        Self::new(None, None)
    }

    /// Creates a client using (in order of precedence):
    /// - explicit `username`/`password` arguments
    /// - environment variables `COPERNICUS_USERNAME` / `COPERNICUS_PASSWORD`
    ///   (and the other `COPERNICUS_*` settings)
    /// - config file from `COPERNICUS_RC`, `./.cdserc`, `./.env` or `~/.cdserc`
    pub fn new(username: Option<String>, password: Option<String>) -> Result<Self> {
        Self::with_config(load_config(username, password)?)
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Transport::new(&config)?;
        let auth = Arc::new(TokenProvider::new(transport.clone(), &config));
        let catalog = Catalog::new(transport.clone(), Arc::clone(&auth), &config);
        let downloader = Downloader::new(transport, Arc::clone(&auth), &config);
        Ok(Self {
            config,
            auth,
            catalog,
            downloader,
        })
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.downloader = self.downloader.with_progress(progress);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.downloader = self.downloader.with_workers(workers);
        self
    }

    /// Searches the catalog for products matching `params`.
    pub fn query(&self, params: &SearchParameters) -> Result<Vec<ProductDescriptor>> {
        self.catalog.query(params)
    }

    pub fn download(
        &self,
        product: &ProductDescriptor,
        dest: impl AsRef<Path>,
    ) -> std::result::Result<DownloadOutcome, DownloadError> {
        self.downloader.download(product, dest)
    }

    pub fn download_by_id(
        &self,
        product_id: &str,
        dest: impl AsRef<Path>,
    ) -> std::result::Result<DownloadOutcome, DownloadError> {
        self.downloader.download_by_id(product_id, dest)
    }

    pub fn download_all(&self, products: &[ProductDescriptor], out_dir: impl AsRef<Path>) -> DownloadReport {
        self.downloader.download_all(products, out_dir)
    }

    pub fn download_all_with_cancel(
        &self,
        products: &[ProductDescriptor],
        out_dir: impl AsRef<Path>,
        cancel: &CancelToken,
    ) -> DownloadReport {
        self.downloader.download_all_with_cancel(products, out_dir, cancel)
    }

    pub fn token_provider(&self) -> &Arc<TokenProvider> {
        &self.auth
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

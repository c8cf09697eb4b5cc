use std::sync::Arc;
use std::thread;

use serde_json::Value;

use crate::auth::TokenProvider;
use crate::config::ClientConfig;
use crate::error::{Error, Result, summarize_body};
use crate::http::{Failure, Transport};
use crate::product::ProductDescriptor;
use crate::query::{QuerySpec, SearchParameters};
use crate::util::{backoff, urljoin};

#[derive(Debug, serde::Deserialize)]
struct CatalogPage {
    value: Vec<Value>,
}

/// Client for the OData `Products` search endpoint.
#[derive(Debug, Clone)]
pub struct Catalog {
    transport: Transport,
    auth: Arc<TokenProvider>,
    products_url: String,
    page_size: usize,
}

impl Catalog {
    pub fn from_config(cfg: &ClientConfig, auth: Arc<TokenProvider>) -> Result<Self> {
        Ok(Self::new(Transport::new(cfg)?, auth, cfg))
    }

    pub(crate) fn new(transport: Transport, auth: Arc<TokenProvider>, cfg: &ClientConfig) -> Self {
        Self {
            transport,
            auth,
            products_url: urljoin(&cfg.urls.catalog, "Products"),
            page_size: cfg.page_size.max(1),
        }
    }

    /// Searches the catalog. Products come back in catalog order, pages
    /// concatenated in request order.
    pub fn query(&self, params: &SearchParameters) -> Result<Vec<ProductDescriptor>> {
        let spec = QuerySpec::build(params)?;
        let products = self.execute(&spec)?;
        if let Some(product_type) = params.product_type.as_deref() {
            if products.is_empty() && !params.mission.is_known_product_type(product_type) {
                tracing::info!(
                    product_type,
                    collection = params.mission.collection(),
                    known = ?params.mission.product_types(),
                    "no products found; product type is not among the known product types"
                );
            }
        }
        Ok(products)
    }

    /// Runs an already built query, paging with `$top`/`$skip` until the
    /// limit is reached or a page comes back short.
    pub fn execute(&self, spec: &QuerySpec) -> Result<Vec<ProductDescriptor>> {
        tracing::debug!(query = %spec, "searching catalog");
        let mut products: Vec<ProductDescriptor> = Vec::new();
        let mut pages = 0usize;
        loop {
            let top = match spec.limit() {
                Some(limit) => limit.saturating_sub(products.len()).min(self.page_size),
                None => self.page_size,
            };
            if top == 0 {
                break;
            }

            let mut page = self.fetch_page(spec, products.len(), top)?;
            pages += 1;
            let received = page.len();
            page.truncate(top);
            products.extend(page);
            if received < top {
                break;
            }
        }

        tracing::info!(products = products.len(), pages, "catalog search complete");
        Ok(products)
    }

    fn fetch_page(&self, spec: &QuerySpec, skip: usize, top: usize) -> Result<Vec<ProductDescriptor>> {
        let url = self.products_url.as_str();
        let params = spec.page_params(skip, top);
        tracing::debug!(url, skip, top, "requesting catalog page");

        let retry = self.transport.retry();
        let mut tries = 0usize;
        let mut sleep = retry.backoff;
        let (status, text) = loop {
            let resp = self
                .transport
                .authorized_get(&self.auth, url, &params, &|| false)
                .map_err(|failure| request_error(url, failure))?;
            let status = resp.status();
            match resp.text() {
                Ok(text) => break (status, text),
                Err(source) if tries < retry.max_retries => {
                    tries += 1;
                    tracing::warn!(error = %source, attempt = tries, "catalog response cut short, backing off");
                    thread::sleep(sleep);
                    sleep = backoff(sleep, retry.max_backoff);
                }
                Err(source) => {
                    return Err(Error::CatalogRequest {
                        url: url.to_string(),
                        status: Some(status.as_u16()),
                        body: "failed to read response body".into(),
                        source: Some(source),
                    });
                }
            }
        };
        if !status.is_success() {
            return Err(Error::CatalogRequest {
                url: url.to_string(),
                status: Some(status.as_u16()),
                body: summarize_body(status, &text),
                source: None,
            });
        }

        parse_page(url, &text)
    }
}

fn request_error(url: &str, failure: Failure) -> Error {
    let (body, source) = match failure {
        Failure::Auth(e) => return e,
        Failure::Transport(source) => (source.to_string(), Some(source)),
        Failure::TooManyRedirects => ("too many redirects".to_string(), None),
        Failure::Cancelled => ("cancelled".to_string(), None),
    };
    Error::CatalogRequest {
        url: url.to_string(),
        status: None,
        body,
        source,
    }
}

fn parse_page(url: &str, text: &str) -> Result<Vec<ProductDescriptor>> {
    let parse_error = |source| Error::CatalogParse {
        url: url.to_string(),
        source,
    };
    let page: CatalogPage = serde_json::from_str(text).map_err(parse_error)?;
    page.value
        .into_iter()
        .map(|v| ProductDescriptor::from_json(v).map_err(parse_error))
        .collect()
}

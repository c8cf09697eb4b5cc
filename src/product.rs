use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::query::AttributeFilters;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Checksum {
    #[serde(rename = "Algorithm")]
    pub algorithm: String,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize)]
pub struct ContentDate {
    #[serde(rename = "Start", default)]
    pub start: Option<String>,
    #[serde(rename = "End", default)]
    pub end: Option<String>,
}

/// Shape of one entry of the catalog's `value` array.
#[derive(Debug, serde::Deserialize)]
struct ODataProduct {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ContentLength", default)]
    content_length: Option<u64>,
    #[serde(rename = "Checksum", default)]
    checksum: Vec<Checksum>,
    #[serde(rename = "ContentDate", default)]
    content_date: Option<ContentDate>,
    #[serde(rename = "Online", default)]
    online: Option<bool>,
    #[serde(rename = "S3Path", default)]
    s3_path: Option<String>,
    #[serde(rename = "Footprint", default)]
    footprint: Option<String>,
    #[serde(rename = "Attributes", default)]
    attributes: Vec<ODataAttribute>,
    #[serde(rename = "@odata.mediaReadLink", alias = "DownloadUrl", default)]
    download_url: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ODataAttribute {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Value,
}

/// A product as returned by the catalog. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductDescriptor {
    id: String,
    name: String,
    size: Option<u64>,
    checksums: Vec<Checksum>,
    content_date: ContentDate,
    online: Option<bool>,
    s3_path: Option<String>,
    footprint: Option<String>,
    download_url: Option<String>,
    attributes: BTreeMap<String, Value>,
    raw: Map<String, Value>,
}

impl ProductDescriptor {
    /// Parses one catalog entry, keeping the original object for inspection.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        let parsed: ODataProduct = serde_json::from_value(value.clone())?;
        let raw = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let attributes = parsed
            .attributes
            .into_iter()
            .map(|a| (a.name, a.value))
            .collect();

        Ok(Self {
            id: parsed.id,
            name: parsed.name,
            size: parsed.content_length,
            checksums: parsed.checksum,
            content_date: parsed.content_date.unwrap_or_default(),
            online: parsed.online,
            s3_path: parsed.s3_path,
            footprint: parsed.footprint,
            download_url: parsed.download_url.filter(|u| !u.is_empty()),
            attributes,
            raw,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes (`ContentLength`).
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn checksums(&self) -> &[Checksum] {
        &self.checksums
    }

    /// Checksum value for `algorithm` (case-insensitive), e.g. `MD5`.
    pub fn checksum(&self, algorithm: &str) -> Option<&str> {
        self.checksums
            .iter()
            .find(|c| c.algorithm.eq_ignore_ascii_case(algorithm))
            .map(|c| c.value.as_str())
    }

    pub fn content_date(&self) -> &ContentDate {
        &self.content_date
    }

    pub fn online(&self) -> Option<bool> {
        self.online
    }

    pub fn s3_path(&self) -> Option<&str> {
        self.s3_path.as_deref()
    }

    pub fn footprint(&self) -> Option<&str> {
        self.footprint.as_deref()
    }

    /// Explicit download link, when the catalog provides one.
    pub fn download_url(&self) -> Option<&str> {
        self.download_url.as_deref()
    }

    /// Product attributes flattened from `Attributes[].Name/Value`.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// The catalog entry exactly as received.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// True when every filter matches; a missing attribute never matches.
    pub fn matches(&self, filters: &AttributeFilters) -> bool {
        filters.iter().all(|(name, filter)| {
            self.attributes
                .get(name)
                .is_some_and(|value| filter.matches(value))
        })
    }
}

/// Keeps the products whose attributes satisfy `filters`, preserving order.
pub fn filter_by_attributes(
    products: &[ProductDescriptor],
    filters: &AttributeFilters,
) -> Vec<ProductDescriptor> {
    products
        .iter()
        .filter(|p| p.matches(filters))
        .cloned()
        .collect()
}

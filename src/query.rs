//! Search parameters and their translation into an OData query.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{Error, Result};
use crate::geometry::validate_wkt;
use crate::util::{odata_quote, odata_timestamp};

/// Sentinel collections served by the CDSE catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mission {
    #[default]
    Sentinel1,
    Sentinel2,
    Sentinel3,
    Sentinel5P,
    Sentinel6,
}

impl Mission {
    /// Collection name as used in `Collection/Name eq '...'`.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Sentinel1 => "SENTINEL-1",
            Self::Sentinel2 => "SENTINEL-2",
            Self::Sentinel3 => "SENTINEL-3",
            Self::Sentinel5P => "SENTINEL-5P",
            Self::Sentinel6 => "SENTINEL-6",
        }
    }

    /// Keywords that identify a product type inside a product name. Other
    /// keywords are still sent to the catalog.
    pub fn product_types(&self) -> &'static [&'static str] {
        match self {
            Self::Sentinel1 => &["RAW", "SLC", "GRD", "GRDH", "GRDM", "OCN", "IW", "EW"],
            Self::Sentinel2 => &["L1C", "L2A"],
            Self::Sentinel3 => &["OL_1", "OL_2", "SL_1", "SL_2", "SR_1", "SR_2", "SR", "SY_2"],
            Self::Sentinel5P => &[
                "L1B_RA_BD1",
                "L1B_RA_BD2",
                "L1B_RA_BD3",
                "L1B_RA_BD4",
                "L1B_RA_BD5",
                "L1B_RA_BD6",
                "L1B_RA_BD7",
                "L1B_RA_BD8",
                "L2__AER_AI",
                "L2__AER_LH",
                "L2__CH4",
                "L2__CLOUD",
                "L2__CO",
                "L2__HCHO",
                "L2__NO2",
                "L2__NP_BD3",
                "L2__NP_BD6",
                "L2__NP_BD7",
                "L2__O3_TCL",
                "L2__O3__PR",
                "L2__O3",
                "L2__SO2",
            ],
            Self::Sentinel6 => &["MW_2__AMR", "P4_1B_LR", "P4_2__LR"],
        }
    }

    pub fn is_known_product_type(&self, product_type: &str) -> bool {
        self.product_types().contains(&product_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Ascending,
    Descending,
}

impl Ordering {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

/// A single attribute value. The variant picks the OData attribute type.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Integer(i64),
    Double(f64),
    String(String),
}

impl AttributeValue {
    fn odata_type(&self) -> &'static str {
        match self {
            Self::Integer(_) => "IntegerAttribute",
            Self::Double(_) => "DoubleAttribute",
            Self::String(_) => "StringAttribute",
        }
    }

    /// NaN and infinities have no OData literal.
    fn validate(&self, key: &str) -> Result<()> {
        match self {
            Self::Double(v) if !v.is_finite() => Err(Error::InvalidQuery(format!(
                "attribute filter {key:?} has a non-finite value {v}"
            ))),
            _ => Ok(()),
        }
    }

    fn literal(&self) -> String {
        match self {
            Self::Integer(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::String(v) => odata_quote(v),
        }
    }

    /// Compares against a JSON attribute value as returned by the catalog.
    pub(crate) fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::Integer(v) => value.as_i64() == Some(*v) || value.as_f64() == Some(*v as f64),
            Self::Double(v) => value.as_f64() == Some(*v),
            Self::String(v) => value.as_str() == Some(v.as_str()),
        }
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Value side of an attribute filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(AttributeValue),
    /// Matches any of the values.
    List(Vec<AttributeValue>),
    /// Inclusive numeric range, e.g. `cloudCover` between 0 and 20.
    Range { min: f64, max: f64 },
}

impl FilterValue {
    pub fn range(min: f64, max: f64) -> Self {
        Self::Range { min, max }
    }

    fn validate(&self, key: &str) -> Result<()> {
        match self {
            Self::Scalar(value) => value.validate(key),
            Self::List(values) => {
                let Some(first) = values.first() else {
                    return Err(Error::InvalidQuery(format!(
                        "attribute filter {key:?} has an empty value list"
                    )));
                };
                if values.iter().any(|v| v.odata_type() != first.odata_type()) {
                    return Err(Error::InvalidQuery(format!(
                        "attribute filter {key:?} mixes value types"
                    )));
                }
                values.iter().try_for_each(|v| v.validate(key))
            }
            Self::Range { min, max } => {
                if !min.is_finite() || !max.is_finite() || min > max {
                    return Err(Error::InvalidQuery(format!(
                        "attribute filter {key:?} has an invalid range [{min}, {max}]"
                    )));
                }
                Ok(())
            }
        }
    }

    fn clause(&self, key: &str) -> String {
        let (kind, predicate) = match self {
            Self::Scalar(v) => {
                let kind = v.odata_type();
                (kind, format!("att/OData.CSC.{kind}/Value eq {}", v.literal()))
            }
            Self::List(values) => {
                let kind = values
                    .first()
                    .map(AttributeValue::odata_type)
                    .unwrap_or("StringAttribute");
                let literals = values
                    .iter()
                    .map(AttributeValue::literal)
                    .collect::<Vec<_>>()
                    .join(",");
                (kind, format!("att/OData.CSC.{kind}/Value in ({literals})"))
            }
            Self::Range { min, max } => {
                let kind = "DoubleAttribute";
                (
                    kind,
                    format!(
                        "att/OData.CSC.{kind}/Value ge {min} and att/OData.CSC.{kind}/Value le {max}"
                    ),
                )
            }
        };
        format!(
            "Attributes/OData.CSC.{kind}/any(att:att/Name eq {} and {predicate})",
            odata_quote(key)
        )
    }

    /// Checks a catalog attribute value against this filter.
    pub(crate) fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::Scalar(v) => v.matches(value),
            Self::List(values) => values.iter().any(|v| v.matches(value)),
            Self::Range { min, max } => value
                .as_f64()
                .is_some_and(|v| v >= *min && v <= *max),
        }
    }
}

impl From<AttributeValue> for FilterValue {
    fn from(v: AttributeValue) -> Self {
        Self::Scalar(v)
    }
}

macro_rules! filter_value_from {
    ($($t:ty),*) => {$(
        impl From<$t> for FilterValue {
            fn from(v: $t) -> Self {
                Self::Scalar(v.into())
            }
        }

        impl From<Vec<$t>> for FilterValue {
            fn from(values: Vec<$t>) -> Self {
                Self::List(values.into_iter().map(AttributeValue::from).collect())
            }
        }
    )*};
}

filter_value_from!(i64, f64, &str, String);

/// Attribute name to filter value. Names are passed to the catalog verbatim.
pub type AttributeFilters = BTreeMap<String, FilterValue>;

/// Parses `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::InvalidQuery(format!("invalid timestamp {s:?}: {e}")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchParameters {
    pub mission: Mission,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Keyword matched as a substring of the product name, e.g. `GRD`.
    pub product_type: Option<String>,
    /// Products whose name contains any of these are excluded.
    pub exclude: Vec<String>,
    /// WKT polygon the product footprint must intersect.
    pub footprint: Option<String>,
    pub order_by: Option<Ordering>,
    pub limit: Option<usize>,
    pub filters: AttributeFilters,
}

impl SearchParameters {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            mission: Mission::default(),
            start,
            end,
            product_type: None,
            exclude: Vec::new(),
            footprint: None,
            order_by: None,
            limit: None,
            filters: AttributeFilters::new(),
        }
    }

    /// Builds parameters from `YYYY-MM-DD` or RFC 3339 strings.
    pub fn between(start: &str, end: &str) -> Result<Self> {
        Ok(Self::new(parse_timestamp(start)?, parse_timestamp(end)?))
    }

    pub fn with_mission(mut self, mission: Mission) -> Self {
        self.mission = mission;
        self
    }

    pub fn with_product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = Some(product_type.into());
        self
    }

    pub fn with_exclude(mut self, substring: impl Into<String>) -> Self {
        self.exclude.push(substring.into());
        self
    }

    pub fn with_footprint(mut self, wkt: impl Into<String>) -> Self {
        self.footprint = Some(wkt.into());
        self
    }

    pub fn with_order_by(mut self, order: Ordering) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.filters.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(Error::InvalidQuery(format!(
                "start {} is after end {}",
                odata_timestamp(&self.start),
                odata_timestamp(&self.end)
            )));
        }
        if self.exclude.iter().any(|s| s.is_empty()) {
            return Err(Error::InvalidQuery("exclusion substrings must not be empty".into()));
        }
        if let Some(wkt) = &self.footprint {
            validate_wkt(wkt)?;
        }
        if self.limit == Some(0) {
            return Err(Error::InvalidQuery("limit must be greater than zero".into()));
        }
        for (key, value) in &self.filters {
            if key.trim().is_empty() {
                return Err(Error::InvalidQuery("attribute filter names must not be empty".into()));
            }
            value.validate(key)?;
        }
        Ok(())
    }
}

/// Fully resolved catalog query for one search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    clauses: Vec<String>,
    order_by: Option<String>,
    limit: Option<usize>,
}

impl QuerySpec {
    pub fn build(params: &SearchParameters) -> Result<Self> {
        params.validate()?;

        let mut clauses = vec![
            format!("Collection/Name eq {}", odata_quote(params.mission.collection())),
            format!(
                "(ContentDate/Start gt {} and ContentDate/Start lt {})",
                odata_timestamp(&params.start),
                odata_timestamp(&params.end)
            ),
        ];
        if let Some(product_type) = &params.product_type {
            clauses.push(format!("contains(Name,{})", odata_quote(product_type)));
        }
        for substring in &params.exclude {
            clauses.push(format!("not contains(Name,{})", odata_quote(substring)));
        }
        if let Some(wkt) = &params.footprint {
            clauses.push(format!(
                "OData.CSC.Intersects(area=geography'SRID=4326;{}')",
                wkt.trim()
            ));
        }
        for (key, value) in &params.filters {
            clauses.push(value.clause(key));
        }

        Ok(Self {
            clauses,
            order_by: params
                .order_by
                .map(|o| format!("ContentDate/Start {}", o.as_str())),
            limit: params.limit,
        })
    }

    pub fn clauses(&self) -> &[String] {
        &self.clauses
    }

    /// The `$filter` expression.
    pub fn filter(&self) -> String {
        self.clauses.join(" and ")
    }

    pub fn order_by(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Query parameters for one catalog page.
    pub(crate) fn page_params(&self, skip: usize, top: usize) -> Vec<(&'static str, String)> {
        let mut params = vec![("$filter", self.filter())];
        if let Some(order_by) = &self.order_by {
            params.push(("$orderby", order_by.clone()));
        }
        params.push(("$top", top.to_string()));
        params.push(("$skip", skip.to_string()));
        params.push(("$expand", "Attributes".to_string()));
        params
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$filter={}", self.filter())?;
        if let Some(order_by) = &self.order_by {
            write!(f, "&$orderby={order_by}")?;
        }
        if let Some(limit) = self.limit {
            write!(f, "&$top={limit}")?;
        }
        write!(f, "&$expand=Attributes")
    }
}

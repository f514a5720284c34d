//! Canonical record shapes shared by every component.
//!
//! Both source adapters normalize into these types, the Storage Manager
//! persists them, and the client reads them back through search.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

use crate::error_handling::CollectError;

/// Assessor's Parcel Number: the stable primary key of a property.
///
/// Always trimmed and non-empty; construct through [`Apn::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Apn(String);

impl Apn {
    /// Parses an identifier, rejecting empty or whitespace-only input.
    pub fn parse(raw: &str) -> Result<Self, CollectError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CollectError::InvalidRecord(
                "APN must be present and non-empty".into(),
            ));
        }
        Ok(Apn(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Apn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Apn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The kinds of data a collection can request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Property,
    Tax,
    Sales,
}

impl DataKind {
    /// Every kind, in persistence order (parent first).
    pub const ALL: [DataKind; 3] = [DataKind::Property, DataKind::Tax, DataKind::Sales];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Property => "property",
            DataKind::Tax => "tax",
            DataKind::Sales => "sales",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a payload came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Cache,
    Remote,
    Scrape,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Cache => "cache",
            DataSource::Remote => "remote",
            DataSource::Scrape => "scrape",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "cache" => Some(DataSource::Cache),
            "remote" => Some(DataSource::Remote),
            "scrape" => Some(DataSource::Scrape),
            _ => None,
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collection priority. Declaration order is the scheduling order.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A property with its descriptive and assessment fields.
///
/// `tax_history` and `sales_history` are populated on reads only; writes of
/// dependents go through the Storage Manager separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub apn: String,
    pub owner_name: Option<String>,
    pub situs_address: Option<String>,
    pub mailing_address: Option<String>,
    pub legal_description: Option<String>,
    pub land_use: Option<String>,
    pub assessed_land_value: Option<f64>,
    pub assessed_improvement_value: Option<f64>,
    pub assessed_total_value: Option<f64>,
    pub year_built: Option<i32>,
    pub lot_size_sqft: Option<f64>,
    /// Provider payload as received, for fields the canonical shape drops
    pub raw_source: Option<serde_json::Value>,
    pub source: Option<DataSource>,
    /// RFC 3339 timestamp of the last write
    pub updated_at: Option<String>,
    #[serde(default)]
    pub tax_history: Vec<TaxRecord>,
    #[serde(default)]
    pub sales_history: Vec<SalesRecord>,
}

impl PropertyRecord {
    /// Minimal record carrying only the identifier. Used as the parent of
    /// dependent rows collected before the property itself.
    pub fn stub(apn: &Apn) -> Self {
        PropertyRecord {
            apn: apn.as_str().to_string(),
            ..Default::default()
        }
    }

    /// True when nothing beyond the identifier is known.
    pub fn is_stub(&self) -> bool {
        self.owner_name.is_none()
            && self.situs_address.is_none()
            && self.assessed_total_value.is_none()
            && self.legal_description.is_none()
    }
}

/// One assessment year of tax history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaxRecord {
    pub apn: String,
    pub tax_year: i32,
    pub assessed_value: Option<f64>,
    pub tax_amount: Option<f64>,
    pub tax_paid: Option<f64>,
    pub delinquent: bool,
}

/// One recorded sale / deed transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalesRecord {
    pub apn: String,
    /// ISO `YYYY-MM-DD`
    pub sale_date: String,
    pub sale_price: Option<f64>,
    pub buyer: Option<String>,
    pub seller: Option<String>,
    pub deed_type: Option<String>,
    pub document_number: Option<String>,
}

/// A dependent row, written only after its parent property exists.
#[derive(Debug, Clone, PartialEq)]
pub enum DependentRecord {
    Tax(TaxRecord),
    Sales(SalesRecord),
}

impl DependentRecord {
    pub fn apn(&self) -> &str {
        match self {
            DependentRecord::Tax(t) => &t.apn,
            DependentRecord::Sales(s) => &s.apn,
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            DependentRecord::Tax(_) => DataKind::Tax,
            DependentRecord::Sales(_) => DataKind::Sales,
        }
    }
}

/// Source-independent result of fetching one data kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum NormalizedPayload {
    Property(PropertyRecord),
    Tax(Vec<TaxRecord>),
    Sales(Vec<SalesRecord>),
}

impl NormalizedPayload {
    pub fn kind(&self) -> DataKind {
        match self {
            NormalizedPayload::Property(_) => DataKind::Property,
            NormalizedPayload::Tax(_) => DataKind::Tax,
            NormalizedPayload::Sales(_) => DataKind::Sales,
        }
    }

    /// True when the payload carries no usable data.
    pub fn is_empty(&self) -> bool {
        match self {
            NormalizedPayload::Property(p) => p.is_stub(),
            NormalizedPayload::Tax(rows) => rows.is_empty(),
            NormalizedPayload::Sales(rows) => rows.is_empty(),
        }
    }

    /// Number of rows carried (a property counts as one).
    pub fn row_count(&self) -> usize {
        match self {
            NormalizedPayload::Property(_) => 1,
            NormalizedPayload::Tax(rows) => rows.len(),
            NormalizedPayload::Sales(rows) => rows.len(),
        }
    }
}

/// Client search criteria. All present fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    /// Exact APN match
    pub apn: Option<String>,
    /// Case-insensitive substring of the owner name
    pub owner_contains: Option<String>,
    /// Case-insensitive substring of the situs address
    pub address_contains: Option<String>,
    pub limit: Option<u32>,
}

impl SearchCriteria {
    pub fn by_apn(apn: &str) -> Self {
        SearchCriteria {
            apn: Some(apn.to_string()),
            ..Default::default()
        }
    }

    /// True when no filter is set.
    pub fn is_empty(&self) -> bool {
        fn blank(v: &Option<String>) -> bool {
            v.as_deref().map(str::trim).unwrap_or("").is_empty()
        }
        blank(&self.apn) && blank(&self.owner_contains) && blank(&self.address_contains)
    }

    /// Criteria as `(key, value)` pairs for cache fingerprinting.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(owner) = &self.owner_contains {
            params.push(("owner", owner.clone()));
        }
        if let Some(address) = &self.address_contains {
            params.push(("address", address.clone()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apn_parse_trims() {
        let apn = Apn::parse("  13238011 ").unwrap();
        assert_eq!(apn.as_str(), "13238011");
    }

    #[test]
    fn test_apn_parse_rejects_blank() {
        assert!(matches!(
            Apn::parse("   "),
            Err(CollectError::InvalidRecord(_))
        ));
        assert!(Apn::parse("").is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_stub_detection() {
        let apn = Apn::parse("100").unwrap();
        let mut record = PropertyRecord::stub(&apn);
        assert!(record.is_stub());
        record.owner_name = Some("Jane Doe".into());
        assert!(!record.is_stub());
    }

    #[test]
    fn test_payload_serialization_is_tagged() {
        let payload = NormalizedPayload::Tax(vec![TaxRecord {
            apn: "1".into(),
            tax_year: 2023,
            ..Default::default()
        }]);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "tax");
        let back: NormalizedPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_search_criteria_empty() {
        assert!(SearchCriteria::default().is_empty());
        assert!(SearchCriteria {
            owner_contains: Some("  ".into()),
            ..Default::default()
        }
        .is_empty());
        assert!(!SearchCriteria::by_apn("13238011").is_empty());
    }
}

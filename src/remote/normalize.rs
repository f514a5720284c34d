//! Mapping of provider JSON to the canonical record shapes.
//!
//! Providers disagree on field names (`ParcelNumber` vs `apn`), ship money as
//! formatted strings and dates in several layouts. Everything is coerced here
//! so the rest of the engine only sees `NormalizedPayload`.

use std::ops::RangeInclusive;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::{Map, Value};

use crate::error_handling::SourceError;
use crate::models::{Apn, DataKind, DataSource, NormalizedPayload, PropertyRecord, SalesRecord, TaxRecord};

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(1[7-9]\d{2}|2\d{3})\b").expect("year pattern is valid"));

/// Years `YEAR` can match.
const PLAUSIBLE_YEARS: RangeInclusive<i32> = 1700..=2999;

const ENVELOPES: &[&str] = &["data", "parcel", "result", "results", "records", "items"];

const APN: &[&str] = &["apn", "APN", "ParcelNumber", "parcel_number", "parcelNumber"];
const OWNER: &[&str] = &["owner_name", "OwnerName", "owner", "Owner"];
const SITUS: &[&str] = &["situs_address", "SitusAddress", "address", "PropertyAddress", "property_address"];
const MAILING: &[&str] = &["mailing_address", "MailingAddress", "mail_address"];
const LEGAL: &[&str] = &["legal_description", "LegalDescription", "legal"];
const LAND_USE: &[&str] = &["land_use", "LandUse", "use_code", "PropertyUseDescription"];
const LAND_VALUE: &[&str] = &["assessed_land_value", "LandValue", "land_value"];
const IMPROVEMENT_VALUE: &[&str] = &["assessed_improvement_value", "ImprovementValue", "improvement_value"];
const TOTAL_VALUE: &[&str] = &["assessed_total_value", "TotalValue", "total_value", "AssessedValue", "assessed_value", "FullCashValue"];
const YEAR_BUILT: &[&str] = &["year_built", "YearBuilt", "ConstructionYear"];
const LOT_SIZE: &[&str] = &["lot_size_sqft", "LotSizeSqFt", "LotSize", "lot_size"];

const TAX_LIST: &[&str] = &["tax_history", "TaxHistory", "taxes"];
const TAX_YEAR: &[&str] = &["tax_year", "TaxYear", "year", "Year"];
const TAX_ASSESSED: &[&str] = &["assessed_value", "AssessedValue", "FullCashValue", "full_cash_value"];
const TAX_AMOUNT: &[&str] = &["tax_amount", "TaxAmount", "amount", "TotalTax"];
const TAX_PAID: &[&str] = &["tax_paid", "TaxPaid", "AmountPaid", "paid_amount"];
const DELINQUENT: &[&str] = &["delinquent", "Delinquent", "is_delinquent"];

const SALES_LIST: &[&str] = &["sales_history", "SalesHistory", "sales"];
const SALE_DATE: &[&str] = &["sale_date", "SaleDate", "date", "RecordingDate", "recording_date"];
const SALE_PRICE: &[&str] = &["sale_price", "SalePrice", "price", "SaleAmount"];
const BUYER: &[&str] = &["buyer", "Buyer", "grantee", "Grantee"];
const SELLER: &[&str] = &["seller", "Seller", "grantor", "Grantor"];
const DEED_TYPE: &[&str] = &["deed_type", "DeedType", "document_type", "DocumentType"];
const DOCUMENT: &[&str] = &["document_number", "DocumentNumber", "doc_number", "RecordingNumber", "recording_number"];

/// Converts one provider response into the payload for `kind`.
///
/// An empty body (`null`, `{}`, `[]`) is `NotFound`; a body that has the
/// wrong shape, or rows none of which can be read, is `Malformed`.
pub fn normalize(apn: &Apn, kind: DataKind, body: Value) -> Result<NormalizedPayload, SourceError> {
    if is_blank(&body) {
        return Err(SourceError::NotFound);
    }
    match kind {
        DataKind::Property => property(apn, body).map(NormalizedPayload::Property),
        DataKind::Tax => {
            let rows = rows(&body, TAX_LIST)?;
            collect_rows(rows, |row| tax_row(apn, row), "tax").map(NormalizedPayload::Tax)
        }
        DataKind::Sales => {
            let rows = rows(&body, SALES_LIST)?;
            collect_rows(rows, |row| sales_row(apn, row), "sales").map(NormalizedPayload::Sales)
        }
    }
}

fn property(apn: &Apn, body: Value) -> Result<PropertyRecord, SourceError> {
    let body = unwrap_envelope(body);
    let Value::Object(fields) = &body else {
        return Err(SourceError::Malformed("property body is not an object".into()));
    };

    if let Some(reported) = pick(fields, APN).and_then(text) {
        if reported != apn.as_str() {
            log::warn!("Provider returned APN {reported} for request {apn}; keeping {apn}");
        }
    }

    let record = PropertyRecord {
        apn: apn.as_str().to_string(),
        owner_name: pick(fields, OWNER).and_then(text),
        situs_address: pick(fields, SITUS).and_then(text),
        mailing_address: pick(fields, MAILING).and_then(text),
        legal_description: pick(fields, LEGAL).and_then(text),
        land_use: pick(fields, LAND_USE).and_then(text),
        assessed_land_value: pick(fields, LAND_VALUE).and_then(number),
        assessed_improvement_value: pick(fields, IMPROVEMENT_VALUE).and_then(number),
        assessed_total_value: pick(fields, TOTAL_VALUE).and_then(number),
        year_built: pick(fields, YEAR_BUILT).and_then(year),
        lot_size_sqft: pick(fields, LOT_SIZE).and_then(number),
        source: Some(DataSource::Remote),
        ..Default::default()
    };
    if record.is_stub() && record.land_use.is_none() && record.year_built.is_none() {
        return Err(SourceError::NotFound);
    }
    Ok(PropertyRecord {
        raw_source: Some(body),
        ..record
    })
}

fn tax_row(apn: &Apn, row: &Map<String, Value>) -> Option<TaxRecord> {
    Some(TaxRecord {
        apn: apn.as_str().to_string(),
        tax_year: pick(row, TAX_YEAR).and_then(year)?,
        assessed_value: pick(row, TAX_ASSESSED).and_then(number),
        tax_amount: pick(row, TAX_AMOUNT).and_then(number),
        tax_paid: pick(row, TAX_PAID).and_then(number),
        delinquent: pick(row, DELINQUENT).map(flag).unwrap_or(false),
    })
}

fn sales_row(apn: &Apn, row: &Map<String, Value>) -> Option<SalesRecord> {
    Some(SalesRecord {
        apn: apn.as_str().to_string(),
        sale_date: pick(row, SALE_DATE).and_then(text).and_then(|d| parse_date(&d))?,
        sale_price: pick(row, SALE_PRICE).and_then(number),
        buyer: pick(row, BUYER).and_then(text),
        seller: pick(row, SELLER).and_then(text),
        deed_type: pick(row, DEED_TYPE).and_then(text),
        document_number: pick(row, DOCUMENT).and_then(text),
    })
}

/// Applies `read` to every row, skipping unreadable ones. Fails only when no
/// row at all could be read.
fn collect_rows<T>(
    rows: &[Value],
    read: impl Fn(&Map<String, Value>) -> Option<T>,
    what: &str,
) -> Result<Vec<T>, SourceError> {
    if rows.is_empty() {
        return Err(SourceError::NotFound);
    }
    let parsed: Vec<T> = rows
        .iter()
        .filter_map(Value::as_object)
        .filter_map(&read)
        .collect();
    if parsed.is_empty() {
        return Err(SourceError::Malformed(format!(
            "none of {} {what} rows could be read",
            rows.len()
        )));
    }
    if parsed.len() < rows.len() {
        log::debug!("Skipped {} unreadable {what} rows", rows.len() - parsed.len());
    }
    Ok(parsed)
}

/// Finds the row array: the body itself, or under a known key.
fn rows<'a>(body: &'a Value, list_keys: &[&str]) -> Result<&'a [Value], SourceError> {
    match body {
        Value::Array(items) => Ok(items.as_slice()),
        Value::Object(fields) => list_keys
            .iter()
            .chain(ENVELOPES)
            .find_map(|key| fields.get(*key))
            .map(|inner| rows(inner, list_keys))
            .unwrap_or_else(|| Err(SourceError::Malformed("no history array in body".into()))),
        _ => Err(SourceError::Malformed("history body is not a list".into())),
    }
}

fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut fields) if fields.len() == 1 => {
            let key = fields.keys().next().cloned().unwrap_or_default();
            if ENVELOPES.contains(&key.as_str()) {
                match fields.remove(&key) {
                    Some(inner @ Value::Object(_)) => inner,
                    Some(other) => {
                        fields.insert(key, other);
                        Value::Object(fields)
                    }
                    None => Value::Object(fields),
                }
            } else {
                Value::Object(fields)
            }
        }
        other => other,
    }
}

fn is_blank(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::Object(fields) => fields.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn pick<'a>(fields: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|alias| fields.get(*alias))
        .find(|value| !value.is_null())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_money(s),
        _ => None,
    }
}

fn year(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|y| i32::try_from(y).ok())
            .filter(|y| PLAUSIBLE_YEARS.contains(y)),
        Value::String(s) => parse_year(s),
        _ => None,
    }
}

fn flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "y" | "yes" | "true" | "1" | "delinquent"
        ),
        _ => false,
    }
}

/// Parses `"$1,234.50"`, `"1234.5"`, `"(250.00)"` and similar.
pub fn parse_money(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let negative = trimmed.starts_with('(') && trimmed.ends_with(')') || trimmed.starts_with('-');
    let digits: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() {
        return None;
    }
    let value: f64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// First plausible four-digit year in `raw` (`"2023"`, `"2023-24"`, `"TY 2021"`).
pub fn parse_year(raw: &str) -> Option<i32> {
    YEAR.captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Normalizes `MM/DD/YYYY`, `YYYY-MM-DD`, `MM-DD-YYYY` and RFC 3339 values to
/// ISO `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive().format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date().format("%Y-%m-%d").to_string());
    }
    ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .map(|d| d.format("%Y-%m-%d").to_string())
}

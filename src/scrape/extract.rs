//! Record extraction from rendered parcel pages.

use scraper::{ElementRef, Html, Selector};

use crate::config::ExtractionRules;
use crate::error_handling::SourceError;
use crate::models::{Apn, DataKind, DataSource, NormalizedPayload, PropertyRecord, SalesRecord, TaxRecord};
use crate::remote::normalize::{parse_date, parse_money, parse_year};

/// Extracts the payload for `kind` from a rendered page.
///
/// A page without the expected detail fields or history table does not match
/// the rules and yields `ExtractionFailed`. A history table that is present
/// but has no readable rows yields `NotFound`.
pub fn extract(
    html: &str,
    apn: &Apn,
    kind: DataKind,
    rules: &ExtractionRules,
) -> Result<NormalizedPayload, SourceError> {
    let document = Html::parse_document(html);
    match kind {
        DataKind::Property => property(&document, apn, rules).map(NormalizedPayload::Property),
        DataKind::Tax => tax_rows(&document, apn, rules).map(NormalizedPayload::Tax),
        DataKind::Sales => sales_rows(&document, apn, rules).map(NormalizedPayload::Sales),
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css)
        .map_err(|e| SourceError::ExtractionFailed(format!("invalid selector {css:?}: {e}")))
}

fn text_of(element: ElementRef<'_>) -> Option<String> {
    let text = element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn field(document: &Html, rules: &ExtractionRules, name: &str) -> Result<Option<String>, SourceError> {
    let css = rules.field_selector.replace("{field}", name);
    let sel = selector(&css)?;
    Ok(document.select(&sel).next().and_then(text_of))
}

fn property(document: &Html, apn: &Apn, rules: &ExtractionRules) -> Result<PropertyRecord, SourceError> {
    if let Some(shown) = field(document, rules, "apn")? {
        let normalized: String = shown.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let requested: String = apn.as_str().chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if normalized != requested {
            return Err(SourceError::ExtractionFailed(format!(
                "page shows parcel {shown}, expected {apn}"
            )));
        }
    }

    let money = |name: &str| -> Result<Option<f64>, SourceError> {
        Ok(field(document, rules, name)?.as_deref().and_then(parse_money))
    };

    let record = PropertyRecord {
        apn: apn.as_str().to_string(),
        owner_name: field(document, rules, "owner")?,
        situs_address: field(document, rules, "situs_address")?,
        mailing_address: field(document, rules, "mailing_address")?,
        legal_description: field(document, rules, "legal_description")?,
        land_use: field(document, rules, "land_use")?,
        assessed_land_value: money("assessed_land_value")?,
        assessed_improvement_value: money("assessed_improvement_value")?,
        assessed_total_value: money("assessed_total_value")?,
        year_built: field(document, rules, "year_built")?.as_deref().and_then(parse_year),
        lot_size_sqft: money("lot_size_sqft")?,
        source: Some(DataSource::Scrape),
        ..Default::default()
    };

    if record.is_stub() && record.land_use.is_none() {
        return Err(SourceError::ExtractionFailed(
            "no property detail fields matched".into(),
        ));
    }
    Ok(record)
}

/// Cell texts of every row matched by `row_css`, or `None` when no table is
/// on the page.
fn table(document: &Html, row_css: &str, rules: &ExtractionRules) -> Result<Option<Vec<Vec<String>>>, SourceError> {
    let row_sel = selector(row_css)?;
    let cell_sel = selector(&rules.cell_selector)?;

    // the table itself must exist even when it has no body rows
    let table_css = row_css.split_whitespace().next().unwrap_or(row_css);
    let table_sel = selector(table_css)?;
    if document.select(&table_sel).next().is_none() {
        return Ok(None);
    }

    let rows = document
        .select(&row_sel)
        .map(|row| {
            row.select(&cell_sel)
                .map(|cell| text_of(cell).unwrap_or_default())
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect();
    Ok(Some(rows))
}

fn cell(cells: &[String], index: usize) -> Option<&str> {
    cells
        .get(index)
        .map(String::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn tax_rows(document: &Html, apn: &Apn, rules: &ExtractionRules) -> Result<Vec<TaxRecord>, SourceError> {
    let Some(rows) = table(document, &rules.tax_row_selector, rules)? else {
        return Err(SourceError::ExtractionFailed("tax history table not found".into()));
    };
    let [year, assessed, amount, paid] = rules.tax_columns;

    let records: Vec<TaxRecord> = rows
        .iter()
        .filter_map(|cells| {
            let tax_year = cell(cells, year).and_then(parse_year)?;
            let tax_amount = cell(cells, amount).and_then(parse_money);
            let tax_paid = cell(cells, paid).and_then(parse_money);
            Some(TaxRecord {
                apn: apn.as_str().to_string(),
                tax_year,
                assessed_value: cell(cells, assessed).and_then(parse_money),
                tax_amount,
                tax_paid,
                delinquent: matches!((tax_amount, tax_paid), (Some(due), Some(paid)) if paid < due),
            })
        })
        .collect();

    if records.is_empty() {
        return Err(SourceError::NotFound);
    }
    Ok(records)
}

fn sales_rows(document: &Html, apn: &Apn, rules: &ExtractionRules) -> Result<Vec<SalesRecord>, SourceError> {
    let Some(rows) = table(document, &rules.sales_row_selector, rules)? else {
        return Err(SourceError::ExtractionFailed("sales history table not found".into()));
    };
    let [date, price, buyer, seller, deed, document_number] = rules.sales_columns;

    let records: Vec<SalesRecord> = rows
        .iter()
        .filter_map(|cells| {
            Some(SalesRecord {
                apn: apn.as_str().to_string(),
                sale_date: cell(cells, date).and_then(parse_date)?,
                sale_price: cell(cells, price).and_then(parse_money),
                buyer: cell(cells, buyer).map(str::to_string),
                seller: cell(cells, seller).map(str::to_string),
                deed_type: cell(cells, deed).map(str::to_string),
                document_number: cell(cells, document_number).map(str::to_string),
            })
        })
        .collect();

    if records.is_empty() {
        return Err(SourceError::NotFound);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <dl>
            <dd data-field="apn">132-38-011</dd>
            <dd data-field="owner">SMITH JOHN &amp; JANE</dd>
            <dd data-field="situs_address">  1201 E MAIN ST
                 MESA AZ </dd>
            <dd data-field="assessed_total_value">$312,400</dd>
            <dd data-field="year_built">1987</dd>
          </dl>
          <table id="tax-history"><tbody>
            <tr><td>2023</td><td>$312,400</td><td>$2,104.18</td><td>$2,104.18</td></tr>
            <tr><td>2022</td><td>$290,100</td><td>$1,998.00</td><td>$0.00</td></tr>
            <tr><td>Total</td><td></td><td></td><td></td></tr>
          </tbody></table>
          <table id="sales-history"><tbody>
            <tr><td>03/15/2019</td><td>$285,000</td><td>SMITH JOHN</td><td>DOE MARY</td><td>WD</td><td>2019-0183344</td></tr>
          </tbody></table>
        </body></html>
    "#;

    fn apn() -> Apn {
        Apn::parse("13238011").unwrap()
    }

    #[test]
    fn test_property_fields() {
        let rules = ExtractionRules::default();
        let NormalizedPayload::Property(record) = extract(PAGE, &apn(), DataKind::Property, &rules).unwrap() else {
            panic!("expected property payload");
        };
        assert_eq!(record.owner_name.as_deref(), Some("SMITH JOHN & JANE"));
        assert_eq!(record.situs_address.as_deref(), Some("1201 E MAIN ST MESA AZ"));
        assert_eq!(record.assessed_total_value, Some(312_400.0));
        assert_eq!(record.year_built, Some(1987));
        assert_eq!(record.source, Some(DataSource::Scrape));
    }

    #[test]
    fn test_tax_rows_skip_unreadable_and_flag_delinquency() {
        let rules = ExtractionRules::default();
        let NormalizedPayload::Tax(rows) = extract(PAGE, &apn(), DataKind::Tax, &rules).unwrap() else {
            panic!("expected tax payload");
        };
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].delinquent);
        assert!(rows[1].delinquent);
        assert_eq!(rows[1].tax_amount, Some(1998.0));
    }

    #[test]
    fn test_sales_rows() {
        let rules = ExtractionRules::default();
        let NormalizedPayload::Sales(rows) = extract(PAGE, &apn(), DataKind::Sales, &rules).unwrap() else {
            panic!("expected sales payload");
        };
        assert_eq!(rows[0].sale_date, "2019-03-15");
        assert_eq!(rows[0].sale_price, Some(285_000.0));
        assert_eq!(rows[0].deed_type.as_deref(), Some("WD"));
    }

    #[test]
    fn test_wrong_parcel_is_an_extraction_failure() {
        let rules = ExtractionRules::default();
        let other = Apn::parse("99999999").unwrap();
        assert!(matches!(
            extract(PAGE, &other, DataKind::Property, &rules),
            Err(SourceError::ExtractionFailed(_))
        ));
    }

    #[test]
    fn test_missing_table_vs_empty_table() {
        let rules = ExtractionRules::default();
        let bare = "<html><body><p>Parcel search</p></body></html>";
        assert!(matches!(
            extract(bare, &apn(), DataKind::Tax, &rules),
            Err(SourceError::ExtractionFailed(_))
        ));

        let empty = r#"<table id="sales-history"><tbody></tbody></table>"#;
        assert_eq!(
            extract(empty, &apn(), DataKind::Sales, &rules),
            Err(SourceError::NotFound)
        );
    }
}

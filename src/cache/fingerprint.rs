use std::fmt;

use crate::models::{Apn, DataKind, SearchCriteria};

/// Tag used for cached search results.
const SEARCH_TAG: &str = "search";

/// Stable cache key: blake3 over the APN, a kind tag, and the normalized
/// request parameters.
///
/// Parameters are trimmed, lower-cased and sorted first, so the same request
/// spelled differently hits the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(apn: &str, tag: &str, params: &[(&str, String)]) -> Self {
        let mut normalized: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_lowercase()))
            .collect();
        normalized.sort();

        let mut hasher = blake3::Hasher::new();
        hasher.update(apn.trim().as_bytes());
        hasher.update(&[0]);
        hasher.update(tag.as_bytes());
        for (key, value) in &normalized {
            hasher.update(&[0]);
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        Fingerprint(hasher.finalize().to_hex().to_string())
    }

    /// Key of one data kind for one parcel, with no extra parameters.
    pub fn for_kind(apn: &Apn, kind: DataKind) -> Self {
        Self::new(apn.as_str(), kind.as_str(), &[])
    }

    pub fn for_search(criteria: &SearchCriteria) -> Self {
        let apn = criteria.apn.as_deref().unwrap_or("");
        Self::new(apn, SEARCH_TAG, &criteria.params())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_order_and_case_do_not_matter() {
        let a = Fingerprint::new(
            "123",
            SEARCH_TAG,
            &[("owner", "Smith ".into()), ("limit", "10".into())],
        );
        let b = Fingerprint::new(
            " 123",
            SEARCH_TAG,
            &[("LIMIT", "10".into()), ("owner", "smith".into())],
        );
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_kind_and_apn_separate_keys() {
        let apn = Apn::parse("13238011").unwrap();
        let other = Apn::parse("13238012").unwrap();
        assert_ne!(
            Fingerprint::for_kind(&apn, DataKind::Tax),
            Fingerprint::for_kind(&apn, DataKind::Sales)
        );
        assert_ne!(
            Fingerprint::for_kind(&apn, DataKind::Tax),
            Fingerprint::for_kind(&other, DataKind::Tax)
        );
    }
}

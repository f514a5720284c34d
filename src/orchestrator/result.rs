use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::error_handling::SourceError;
use crate::models::{Apn, DataKind, DataSource, NormalizedPayload};

/// One failed source attempt within a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct KindError {
    pub kind: DataKind,
    pub source: DataSource,
    pub error: SourceError,
}

impl fmt::Display for KindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}: {}", self.kind, self.source, self.error)
    }
}

/// How much of a collection came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionOutcome {
    /// Every requested kind has data
    Collected,
    /// Some requested kinds have data
    Partial,
    /// No source produced anything
    NoData,
}

/// Everything one collection produced.
///
/// Kinds that no source could supply are absent from `data` and explained in
/// `errors`. Errors are also kept for kinds that did end up with data, e.g.
/// the remote `NotFound` that preceded a successful scrape.
#[derive(Debug, Clone)]
pub struct CollectionResult {
    pub apn: Apn,
    pub requested: Vec<DataKind>,
    pub data: BTreeMap<DataKind, NormalizedPayload>,
    pub sources_used: BTreeMap<DataKind, DataSource>,
    pub errors: Vec<KindError>,
}

impl CollectionResult {
    pub fn new(apn: Apn, requested: Vec<DataKind>) -> Self {
        CollectionResult {
            apn,
            requested,
            data: BTreeMap::new(),
            sources_used: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, payload: NormalizedPayload, source: DataSource) {
        let kind = payload.kind();
        self.sources_used.insert(kind, source);
        self.data.insert(kind, payload);
    }

    pub(crate) fn record_error(&mut self, kind: DataKind, source: DataSource, error: SourceError) {
        self.errors.push(KindError { kind, source, error });
    }

    pub fn outcome(&self) -> CollectionOutcome {
        let found = self
            .requested
            .iter()
            .filter(|kind| self.data.contains_key(kind))
            .count();
        if found == 0 {
            CollectionOutcome::NoData
        } else if found == self.requested.len() {
            CollectionOutcome::Collected
        } else {
            CollectionOutcome::Partial
        }
    }

    /// Sources that contributed data, deduplicated, in chain order.
    pub fn sources(&self) -> Vec<DataSource> {
        self.sources_used
            .values()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// True when any payload came from a remote or browser fetch.
    pub fn has_fresh_data(&self) -> bool {
        self.sources_used
            .values()
            .any(|source| *source != DataSource::Cache)
    }

    /// First error that was not an absence report. `None` means every
    /// missing kind is genuinely missing at its sources.
    ///
    /// Only absences allow fallback, so a non-absence error is never followed
    /// by data for its kind; the exception is a payload the store refused,
    /// which also counts as a failure.
    pub fn failure(&self) -> Option<&KindError> {
        self.errors.iter().find(|e| !e.error.is_absence())
    }

    /// True when the store refused this kind's payload.
    pub(crate) fn write_failed(&self, kind: DataKind) -> bool {
        self.errors
            .iter()
            .any(|e| e.kind == kind && matches!(e.error, SourceError::Storage(_)))
    }

    pub fn summary(&self) -> CollectionSummary {
        CollectionSummary {
            outcome: self.outcome(),
            collected: self.data.keys().copied().collect(),
            rows: self.data.values().map(NormalizedPayload::row_count).sum(),
            sources: self.sources(),
            errors: self
                .errors
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Serializable digest of a `CollectionResult`, kept on finished jobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionSummary {
    pub outcome: CollectionOutcome,
    pub collected: Vec<DataKind>,
    pub rows: usize,
    pub sources: Vec<DataSource>,
    pub errors: Vec<String>,
}

//! Shared fakes for unit tests across modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::error_handling::{ConstructionError, SourceError};
use crate::models::{Apn, DataKind, DataSource, NormalizedPayload, PropertyRecord, SalesRecord, TaxRecord};
use crate::remote::RemoteSource;
use crate::storage::StorageManager;

/// Opens a migrated store in `dir`.
pub async fn create_test_storage(dir: &TempDir, max_connections: u32) -> StorageManager {
    StorageManager::open(
        &dir.path().join("records.db"),
        max_connections,
        Duration::from_secs(2),
    )
    .await
    .expect("Failed to open test store")
}

/// A complete payload of `kind` for `apn`.
pub fn sample_payload(apn: &Apn, kind: DataKind) -> NormalizedPayload {
    let apn = apn.as_str().to_string();
    match kind {
        DataKind::Property => NormalizedPayload::Property(PropertyRecord {
            apn,
            owner_name: Some("SMITH JOHN".into()),
            situs_address: Some("1201 E MAIN ST".into()),
            assessed_total_value: Some(312_400.0),
            source: Some(DataSource::Remote),
            ..Default::default()
        }),
        DataKind::Tax => NormalizedPayload::Tax(vec![TaxRecord {
            apn,
            tax_year: 2023,
            tax_amount: Some(2104.18),
            ..Default::default()
        }]),
        DataKind::Sales => NormalizedPayload::Sales(vec![SalesRecord {
            apn,
            sale_date: "2019-03-15".into(),
            sale_price: Some(285_000.0),
            ..Default::default()
        }]),
    }
}

/// Remote source double.
///
/// Answers from a per-kind script when one is set, otherwise with
/// `sample_payload`. Calls for the gated APN wait for a permit first.
pub struct FakeRemote {
    script: HashMap<DataKind, Result<NormalizedPayload, SourceError>>,
    delay: Duration,
    gate: Option<(String, Arc<Semaphore>)>,
    valid: bool,
    calls: Mutex<Vec<(String, DataKind)>>,
    in_flight: AtomicUsize,
}

impl FakeRemote {
    pub fn complete() -> Self {
        FakeRemote {
            script: HashMap::new(),
            delay: Duration::ZERO,
            gate: None,
            valid: true,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Answers only the listed kinds; anything else is `NotFound`.
    pub fn scripted(answers: Vec<(DataKind, Result<NormalizedPayload, SourceError>)>) -> Self {
        let mut script: HashMap<_, _> = answers.into_iter().collect();
        for kind in DataKind::ALL {
            script.entry(kind).or_insert(Err(SourceError::NotFound));
        }
        FakeRemote {
            script,
            ..Self::complete()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn gated(mut self, apn: &str, gate: Arc<Semaphore>) -> Self {
        self.gate = Some((apn.to_string(), gate));
        self
    }

    /// Fails `validate()`.
    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    pub fn calls(&self) -> Vec<(String, DataKind)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// APNs in the order their first call arrived.
    pub fn apn_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for (apn, _) in self.calls.lock().iter() {
            if !order.contains(apn) {
                order.push(apn.clone());
            }
        }
        order
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn fetch(&self, apn: &Apn, kind: DataKind) -> Result<NormalizedPayload, SourceError> {
        self.calls.lock().push((apn.as_str().to_string(), kind));
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        if let Some((gated, gate)) = &self.gate {
            if gated == apn.as_str() {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match self.script.get(&kind) {
            Some(answer) => answer.clone(),
            None => Ok(sample_payload(apn, kind)),
        }
    }

    fn supports(&self, _kind: DataKind) -> bool {
        true
    }

    fn validate(&self) -> Result<(), ConstructionError> {
        if self.valid {
            Ok(())
        } else {
            Err(ConstructionError::InvalidRemoteSource("API token is empty".into()))
        }
    }
}

//! Single-flight wrapper around the [`Resolver`].
//!
//! Loads the latest [`FetchAttemptState`] revision from the store, runs one
//! resolve, and persists the new revision. At most one resolve runs at a
//! time: a caller arriving while one is in flight receives the previous
//! result (tagged [`FetchSource::Shared`]) or, if there is none yet, waits
//! for the in-flight resolve and shares its result.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::models::RegulationRecord;
use crate::store::RecordStore;

use super::{health_status, FetchAttemptState, FetchOutcome, FetchSource, HealthStatus, Resolver};

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub records: Vec<RegulationRecord>,
    pub outcome: FetchOutcome,
}

pub struct FetchService {
    resolver: Resolver,
    store: Arc<dyn RecordStore>,
    in_flight: tokio::sync::Mutex<()>,
    last: Mutex<Option<FetchResult>>,
}

impl FetchService {
    pub fn new(resolver: Resolver, store: Arc<dyn RecordStore>) -> Self {
        Self {
            resolver,
            store,
            in_flight: tokio::sync::Mutex::new(()),
            last: Mutex::new(None),
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Latest persisted state, or a fresh one on first use.
    pub async fn load_state(&self) -> Result<FetchAttemptState> {
        match self.store.load_fetch_state().await? {
            Some(json) => Ok(FetchAttemptState::from_json(&json)?),
            None => Ok(FetchAttemptState::new(self.resolver.candidates().to_vec())),
        }
    }

    /// Health from persisted state; performs no network I/O.
    pub async fn health(&self) -> Result<HealthStatus> {
        let state = self.load_state().await?;
        Ok(health_status(
            &state,
            self.resolver.cache_policy(),
            chrono::Utc::now().timestamp(),
        ))
    }

    pub async fn fetch(&self) -> Result<FetchResult> {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if let Some(previous) = self.shared_previous() {
                    debug!("fetch in flight; returning previous result");
                    return Ok(previous);
                }
                let guard = self.in_flight.lock().await;
                if let Some(previous) = self.shared_previous() {
                    return Ok(previous);
                }
                guard
            }
        };

        let mut state = self.load_state().await?;
        let (records, outcome) = self.resolver.resolve_and_fetch(&mut state).await?;
        self.store.save_fetch_state(&state.to_json()?).await?;

        let result = FetchResult { records, outcome };
        if let Ok(mut last) = self.last.lock() {
            *last = Some(result.clone());
        }
        Ok(result)
    }

    fn shared_previous(&self) -> Option<FetchResult> {
        let last = self.last.lock().ok()?;
        last.as_ref().map(|r| {
            let mut shared = r.clone();
            shared.outcome.source = FetchSource::Shared;
            shared
        })
    }
}

//! Full and delta synchronization of CQC facilities into the GP table.

pub mod facility;

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::cqc::{CqcError, CqcLocation, CqcProvider, CqcReport, RegulatorApi};
use crate::database_ops::FacilityStore;
use crate::normalization::{DataProcessor, FacilityRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Delta,
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "delta" => Ok(Self::Delta),
            other => Err(format!("unknown sync mode '{other}' (expected full or delta)")),
        }
    }
}

/// Where in a run a non-fatal error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStage {
    Location,
    Provider,
    Report,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub stage: SyncStage,
    pub key: String,
    pub message: String,
}

/// Counters for one run. Built per request, returned, never persisted.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub locations_processed: u64,
    pub providers_processed: u64,
    pub reports_processed: u64,
    pub records_upserted: u64,
    pub locations_skipped: u64,
    pub pages_traversed: u32,
    pub retry_attempts: u32,
    #[serde(skip)]
    pub errors: Vec<RunError>,
}

impl SyncStats {
    pub fn record_error(&mut self, stage: SyncStage, key: impl Into<String>, err: impl Display) {
        let key = key.into();
        let message = err.to_string();
        warn!(stage = ?stage, key, error = %message, "sync step failed; continuing");
        self.errors.push(RunError {
            stage,
            key,
            message,
        });
    }

    pub fn summary(self, mode: SyncMode, elapsed: Duration) -> SyncSummary {
        let error_count = self.errors.len();
        let errors = (error_count > 0).then(|| self.errors.clone());
        SyncSummary {
            status: if error_count == 0 { "success" } else { "partial" },
            mode,
            stats: self,
            errors,
            error_count,
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }
}

/// JSON body returned by the sync endpoint and the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub status: &'static str,
    pub mode: SyncMode,
    #[serde(flatten)]
    pub stats: SyncStats,
    pub errors: Option<Vec<RunError>>,
    pub error_count: usize,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub upsert_chunk_size: usize,
    /// Delta runs drop changed locations outside this inspection category.
    pub facility_category: String,
}

impl SyncOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            batch_size: cfg.sync.batch_size,
            upsert_chunk_size: cfg.store.upsert_chunk_size,
            facility_category: cfg.cqc.facility_category.clone(),
        }
    }
}

/// Normalize a caller supplied RFC 3339 timestamp into the UTC
/// `YYYY-MM-DDTHH:MM:SSZ` form the change feed expects.
pub fn change_window_timestamp(raw: &str) -> Result<String, chrono::ParseError> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())?;
    Ok(format_change_timestamp(parsed.with_timezone(&Utc)))
}

pub fn format_change_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Per-run memo so a provider or report referenced by many locations is
/// fetched once. A failed provider fetch is remembered as `None`.
#[derive(Default)]
struct RunCache {
    providers: HashMap<String, Option<CqcProvider>>,
    reports: HashMap<String, CqcReport>,
}

pub struct SyncService<'a> {
    api: &'a dyn RegulatorApi,
    store: &'a dyn FacilityStore,
    processor: DataProcessor,
    opts: SyncOptions,
}

impl<'a> SyncService<'a> {
    pub fn new(api: &'a dyn RegulatorApi, store: &'a dyn FacilityStore, opts: SyncOptions) -> Self {
        Self {
            api,
            store,
            processor: DataProcessor::new(),
            opts,
        }
    }

    /// Walk the whole listing and upsert it batch by batch. Only a failed
    /// listing aborts the run.
    #[instrument(skip(self))]
    pub async fn full_sync(&self) -> Result<SyncStats, CqcError> {
        let mut stats = SyncStats::default();
        let listing = self.api.fetch_all_locations().await?;
        stats.pages_traversed = listing.pages;
        for (key, reason) in &listing.malformed {
            stats.record_error(SyncStage::Location, key.clone(), reason);
        }
        info!(
            locations = listing.locations.len(),
            pages = listing.pages,
            batch_size = self.opts.batch_size,
            "full sync starting"
        );

        let mut cache = RunCache::default();
        for (batch_no, batch) in listing
            .locations
            .chunks(self.opts.batch_size.max(1))
            .enumerate()
        {
            let mut records = Vec::with_capacity(batch.len());
            for summary in batch {
                if let Some(rec) = self
                    .build_record(&summary.location_id, &mut cache, &mut stats, false)
                    .await
                {
                    records.push(rec);
                }
            }
            if records.is_empty() {
                continue;
            }
            match self
                .store
                .bulk_upsert_records(records, self.opts.upsert_chunk_size)
                .await
            {
                Ok(affected) => stats.records_upserted += affected,
                Err(e) => stats.record_error(SyncStage::Batch, format!("batch-{batch_no}"), e),
            }
            info!(batch = batch_no, upserted = stats.records_upserted, "batch done");
        }

        stats.retry_attempts = self.api.retry_attempts();
        info!(
            processed = stats.locations_processed,
            upserted = stats.records_upserted,
            errors = stats.errors.len(),
            "full sync finished"
        );
        Ok(stats)
    }

    /// Re-sync locations named by the change feeds in `[start, end)`, each at
    /// most once, upserting as it goes.
    #[instrument(skip(self))]
    pub async fn delta_sync(&self, start: &str, end: Option<&str>) -> Result<SyncStats, CqcError> {
        let mut stats = SyncStats::default();
        let changed_locations = self.api.fetch_location_changes(start, end).await?;
        let changed_providers = self.api.fetch_provider_changes(start, end).await?;
        info!(
            locations = changed_locations.len(),
            providers = changed_providers.len(),
            "delta sync starting"
        );

        let mut cache = RunCache::default();
        let mut seen: HashSet<String> = HashSet::new();

        for location_id in changed_locations {
            if !seen.insert(location_id.clone()) {
                continue;
            }
            self.sync_one(&location_id, &mut cache, &mut stats).await;
        }

        for provider_id in changed_providers {
            let Some(provider) = self.provider(&provider_id, &mut cache, &mut stats).await else {
                continue;
            };
            for location_id in provider.location_ids() {
                if !seen.insert(location_id.clone()) {
                    continue;
                }
                self.sync_one(&location_id, &mut cache, &mut stats).await;
            }
        }

        stats.retry_attempts = self.api.retry_attempts();
        info!(
            processed = stats.locations_processed,
            skipped = stats.locations_skipped,
            errors = stats.errors.len(),
            "delta sync finished"
        );
        Ok(stats)
    }

    async fn sync_one(&self, location_id: &str, cache: &mut RunCache, stats: &mut SyncStats) {
        let Some(rec) = self.build_record(location_id, cache, stats, true).await else {
            return;
        };
        match self.store.upsert_record(rec).await {
            Ok(affected) => stats.records_upserted += affected,
            Err(e) => stats.record_error(SyncStage::Location, location_id, e),
        }
    }

    async fn build_record(
        &self,
        location_id: &str,
        cache: &mut RunCache,
        stats: &mut SyncStats,
        filter_category: bool,
    ) -> Option<FacilityRecord> {
        let location = match self.api.fetch_location_by_id(location_id).await {
            Ok(l) => l,
            Err(e) => {
                stats.record_error(SyncStage::Location, location_id, e);
                return None;
            }
        };
        if filter_category && !location.in_inspection_category(&self.opts.facility_category) {
            stats.locations_skipped += 1;
            return None;
        }

        // Writing without the provider would null its stored columns.
        let provider = match location.provider_id.as_deref() {
            Some(pid) => match self.provider(pid, cache, stats).await {
                Some(p) => Some(p),
                None => {
                    warn!(
                        location_id,
                        provider_id = pid,
                        "provider unavailable; location left as stored"
                    );
                    stats.locations_skipped += 1;
                    return None;
                }
            },
            None => None,
        };
        let reports = self
            .reports(&location, provider.as_ref(), cache, stats)
            .await;

        let record = self
            .processor
            .process_location(&location, provider.as_ref(), &reports);
        stats.locations_processed += 1;
        Some(record)
    }

    async fn provider(
        &self,
        provider_id: &str,
        cache: &mut RunCache,
        stats: &mut SyncStats,
    ) -> Option<CqcProvider> {
        if let Some(hit) = cache.providers.get(provider_id) {
            return hit.clone();
        }
        let fetched = match self.api.fetch_provider_by_id(provider_id).await {
            Ok(p) => {
                stats.providers_processed += 1;
                Some(p)
            }
            Err(e) => {
                stats.record_error(SyncStage::Provider, provider_id, e);
                None
            }
        };
        cache
            .providers
            .insert(provider_id.to_string(), fetched.clone());
        fetched
    }

    async fn reports(
        &self,
        location: &CqcLocation,
        provider: Option<&CqcProvider>,
        cache: &mut RunCache,
        stats: &mut SyncStats,
    ) -> Vec<CqcReport> {
        let mut ids: IndexSet<String> = location.report_link_ids().into_iter().collect();
        if let Some(p) = provider {
            ids.extend(p.report_link_ids());
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(hit) = cache.reports.get(&id) {
                out.push(hit.clone());
                continue;
            }
            match self.api.fetch_report_by_id(&id).await {
                Ok(report) => {
                    stats.reports_processed += 1;
                    cache.reports.insert(id, report.clone());
                    out.push(report);
                }
                Err(e) => stats.record_error(SyncStage::Report, id, e),
            }
        }
        out
    }
}

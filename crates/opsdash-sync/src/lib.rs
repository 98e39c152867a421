//! Merge engine and dashboard workflows.
//!
//! The merge pipeline (identity → grouping → reconcile → aggregate) is pure
//! and lives in its own modules. [`Dashboard`] wires it to the document
//! store, the classifier and the per-date locks.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use opsdash_adapters::AdapterError;
use opsdash_core::{parse_date, DateError};
use opsdash_storage::{
    Classifier, FsDocumentStore, HttpClassifier, SharedStore, StoreError,
};
use thiserror::Error;
use tracing::{info, warn};

pub mod aggregate;
pub mod config;
pub mod daily;
pub mod export;
pub mod grouping;
pub mod identity;
pub mod locks;
pub mod profile;
pub mod reconcile;
pub mod reports;
pub mod rules;
pub mod scheduler;

pub use aggregate::{aggregate, aggregate_with, household_key, AggregatorConfig, CategoryRule, Predicate};
pub use config::{AppConfig, ProcessingSettings};
pub use daily::{classified_event, IngestReport, ResetReport, ResetScope};
pub use grouping::{group, group_by_identity, within_window};
pub use identity::{resolve_identity, IdentityPolicy, IdentityTier};
pub use locks::DateLocks;
pub use profile::{MergeProfile, SALE_WINDOW_MONTHS};
pub use reconcile::{reconcile, ReconcilePolicy};
pub use reports::{ComplaintReport, OecSalesReport, PnlLine, PnlReport, SaleRow, UploadBatch, UploadReport};
pub use rules::{DashboardRules, PnlConfig, SaleEconomics};
pub use scheduler::{maybe_build_scheduler, run_scheduled};

pub const CRATE_NAME: &str = "opsdash-sync";

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error(transparent)]
    InvalidDate(#[from] DateError),
    #[error("processing already in progress for {date}")]
    Busy { date: String },
    #[error("no document for {date}")]
    NotFound { date: String },
    #[error("invalid range: {from} is after {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },
    #[error("no classifier configured")]
    ClassifierUnavailable,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub(crate) fn canonical_date(value: &str) -> Result<String, DateError> {
    parse_date(value).map(|d| d.format("%Y-%m-%d").to_string())
}

pub(crate) fn date_range(from: &str, to: &str) -> Result<(NaiveDate, NaiveDate), DashboardError> {
    let from = parse_date(from)?;
    let to = parse_date(to)?;
    if from > to {
        return Err(DashboardError::InvalidRange { from, to });
    }
    Ok((from, to))
}

/// Store, classifier and configuration shared by every request.
pub struct Dashboard {
    store: SharedStore,
    classifier: Option<Arc<dyn Classifier>>,
    locks: DateLocks,
    settings: ProcessingSettings,
    rules: DashboardRules,
    pnl: PnlConfig,
}

impl Dashboard {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            classifier: None,
            locks: DateLocks::new(),
            settings: ProcessingSettings::default(),
            rules: DashboardRules::default(),
            pnl: PnlConfig::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_settings(mut self, settings: ProcessingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Defaults used when the store holds no override.
    pub fn with_rules(mut self, rules: DashboardRules, pnl: PnlConfig) -> Self {
        self.rules = rules;
        self.pnl = pnl;
        self
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store: SharedStore = Arc::new(FsDocumentStore::new(config.data_dir.clone()));
        let (rules, pnl) = load_rule_files(&config.workspace_root);
        let mut dashboard = Self::new(store)
            .with_settings(config.processing.clone())
            .with_rules(rules, pnl);

        if let Some(classifier_config) = config.classifier_config() {
            let classifier = HttpClassifier::new(classifier_config).context("building classifier client")?;
            dashboard = dashboard.with_classifier(Arc::new(classifier));
        } else {
            info!("no classifier endpoint configured; processing is disabled");
        }
        Ok(dashboard)
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn settings(&self) -> &ProcessingSettings {
        &self.settings
    }

    pub fn default_rules(&self) -> &DashboardRules {
        &self.rules
    }

    pub fn default_pnl(&self) -> &PnlConfig {
        &self.pnl
    }

    pub async fn effective_rules(&self) -> Result<DashboardRules, DashboardError> {
        Ok(rules::effective_rules(self.store.as_ref(), &self.rules).await?)
    }

    pub async fn effective_pnl(&self) -> Result<PnlConfig, DashboardError> {
        Ok(rules::effective_pnl(self.store.as_ref(), &self.pnl).await?)
    }

    pub async fn save_rules(&self, rules: &DashboardRules) -> Result<(), DashboardError> {
        opsdash_storage::put_json(self.store.as_ref(), rules::DASHBOARD_CONFIG_KEY, rules).await?;
        Ok(())
    }

    pub async fn save_pnl(&self, pnl: &PnlConfig) -> Result<(), DashboardError> {
        opsdash_storage::put_json(self.store.as_ref(), rules::PNL_CONFIG_KEY, pnl).await?;
        Ok(())
    }
}

/// Rule files are optional; a missing or broken file falls back to built-ins.
fn load_rule_files(root: &Path) -> (DashboardRules, PnlConfig) {
    let rules = DashboardRules::from_workspace_root(root).unwrap_or_else(|err| {
        warn!(error = %format!("{err:#}"), "using built-in dashboard rules");
        DashboardRules::default()
    });
    let pnl = PnlConfig::from_workspace_root(root).unwrap_or_else(|err| {
        warn!(error = %format!("{err:#}"), "using empty P&L config");
        PnlConfig::default()
    });
    (rules, pnl)
}

//! Dashboard and P&L configuration.
//!
//! Defaults live in YAML files under `<workspace>/rules/`. An override saved
//! in the document store replaces the whole default document; it is read once
//! per request and handed down explicitly.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use opsdash_storage::{get_json, DocumentStore, StoreError};
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregatorConfig, CategoryRule, Predicate};

pub const DASHBOARD_CONFIG_KEY: &str = "config/dashboard.json";
pub const PNL_CONFIG_KEY: &str = "config/pnl.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardRules {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(flatten)]
    pub aggregator: AggregatorConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for DashboardRules {
    /// Built-in cards used when no rules file is present.
    fn default() -> Self {
        Self {
            version: 1,
            aggregator: AggregatorConfig {
                categories: vec![
                    CategoryRule::service("oec", "oec"),
                    CategoryRule::service("owwa", "owwa"),
                    CategoryRule::service("travel_visa", "travel_visa"),
                    CategoryRule {
                        name: "filipina_cc".to_string(),
                        when: Predicate::All {
                            of: vec![
                                Predicate::set_contains(
                                    opsdash_adapters::fields::COUNTRIES,
                                    "Philippines",
                                ),
                                Predicate::Scalar {
                                    field: opsdash_adapters::fields::CONTRACT_TYPE.to_string(),
                                    equals: "CC".to_string(),
                                },
                            ],
                        },
                        converted: None,
                    },
                ],
                ..AggregatorConfig::default()
            },
        }
    }
}

impl DashboardRules {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        read_yaml(&root.join("rules").join("dashboard.yaml"), "rules/dashboard.yaml")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SaleEconomics {
    #[serde(default)]
    pub unit_revenue: f64,
    #[serde(default)]
    pub unit_cost: f64,
}

/// Unit economics per sale type and per complaint type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Keyed by sale type, matched case-insensitively.
    #[serde(default)]
    pub sales: BTreeMap<String, SaleEconomics>,
    /// Cost per household-deduplicated complaint, keyed by complaint type.
    #[serde(default)]
    pub complaints: BTreeMap<String, f64>,
    #[serde(default)]
    pub default_complaint_cost: f64,
}

fn default_currency() -> String {
    "AED".to_string()
}

impl Default for PnlConfig {
    fn default() -> Self {
        Self {
            version: 1,
            currency: default_currency(),
            sales: BTreeMap::new(),
            complaints: BTreeMap::new(),
            default_complaint_cost: 0.0,
        }
    }
}

impl PnlConfig {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        read_yaml(&root.join("rules").join("pnl.yaml"), "rules/pnl.yaml")
    }

    pub fn sale_economics(&self, sale_type: &str) -> Option<SaleEconomics> {
        self.sales
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(sale_type.trim()))
            .map(|(_, economics)| *economics)
    }

    pub fn complaint_cost(&self, complaint_type: &str) -> f64 {
        self.complaints
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(complaint_type.trim()))
            .map(|(_, cost)| *cost)
            .unwrap_or(self.default_complaint_cost)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path, label: &str) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {label}"))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {label}"))
}

/// Store override if present, else the given default.
pub async fn effective_rules(
    store: &dyn DocumentStore,
    default: &DashboardRules,
) -> Result<DashboardRules, StoreError> {
    Ok(get_json::<DashboardRules>(store, DASHBOARD_CONFIG_KEY)
        .await?
        .unwrap_or_else(|| default.clone()))
}

pub async fn effective_pnl(store: &dyn DocumentStore, default: &PnlConfig) -> Result<PnlConfig, StoreError> {
    Ok(get_json::<PnlConfig>(store, PNL_CONFIG_KEY)
        .await?
        .unwrap_or_else(|| default.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsdash_storage::{put_json, MemoryDocumentStore};

    #[test]
    fn dashboard_yaml_parses_with_flattened_aggregator_fields() {
        let rules: DashboardRules = serde_yaml::from_str(
            r#"
version: 2
household_field: contract_id
categories:
  - name: oec
    when: { kind: set_contains, field: prospect_services, value: oec }
    converted: { kind: set_contains, field: converted_services, value: oec }
"#,
        )
        .unwrap();
        assert_eq!(rules.version, 2);
        assert_eq!(rules.aggregator.categories.len(), 1);
        assert_eq!(rules.aggregator.dimension_field.as_deref(), Some("contract_type"));
        assert_eq!(rules.aggregator.set_fields, vec!["countries"]);
    }

    #[test]
    fn pnl_lookups_ignore_case_and_fall_back() {
        let config: PnlConfig = serde_yaml::from_str(
            r#"
currency: AED
sales:
  Overseas Employment Certificate: { unit_revenue: 250.0, unit_cost: 40.0 }
complaints:
  Visa delay: 120.0
default_complaint_cost: 50.0
"#,
        )
        .unwrap();
        let oec = config.sale_economics("overseas employment certificate").unwrap();
        assert_eq!(oec.unit_revenue, 250.0);
        assert!(config.sale_economics("travel visa").is_none());
        assert_eq!(config.complaint_cost("VISA DELAY"), 120.0);
        assert_eq!(config.complaint_cost("salary"), 50.0);
    }

    #[tokio::test]
    async fn store_override_replaces_the_default() {
        let store = MemoryDocumentStore::new();
        let default = DashboardRules::default();
        assert_eq!(effective_rules(&store, &default).await.unwrap(), default);

        let custom = DashboardRules {
            version: 7,
            aggregator: AggregatorConfig::default(),
        };
        put_json(&store, DASHBOARD_CONFIG_KEY, &custom).await.unwrap();
        assert_eq!(effective_rules(&store, &default).await.unwrap(), custom);
    }

    #[test]
    fn missing_rules_file_is_reported_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = PnlConfig::from_workspace_root(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("reading rules/pnl.yaml"));
    }
}

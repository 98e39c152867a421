//! OEC sales, complaint and P&L reports over uploaded rows.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use opsdash_adapters::{adapter_for, fields, SourceKind};
use opsdash_core::{CategoryCount, MergedEntity, RawEvent, Summary};
use opsdash_storage::{get_json, put_json};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::aggregate::{aggregate_with, household_key, CategoryRule, Predicate};
use crate::identity::resolve_identity;
use crate::profile::MergeProfile;
use crate::{canonical_date, date_range, Dashboard, DashboardError};

pub const OEC_PREFIX: &str = "oec/";
pub const COMPLAINTS_PREFIX: &str = "complaints/";

const UNTYPED: &str = "uncategorized";

/// Normalised rows uploaded for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadBatch {
    pub date: String,
    pub kind: SourceKind,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    pub date: String,
    pub kind: SourceKind,
    pub received: usize,
    pub added: usize,
    pub duplicates: usize,
    pub total_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRow {
    pub key: String,
    pub sale_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub events: usize,
    pub contract_id: Option<String>,
    pub contract_type: Option<String>,
    pub client_name: Option<String>,
    pub maid_name: Option<String>,
    pub record_ids: Vec<String>,
}

impl SaleRow {
    fn from_entity(entity: &MergedEntity) -> Self {
        let scalar = |name: &str| entity.scalar(name).map(ToString::to_string);
        Self {
            key: entity.key.to_string(),
            sale_type: entity_type(entity),
            start_time: entity.start_time,
            end_time: entity.end_time,
            events: entity.event_count(),
            contract_id: scalar(fields::CONTRACT_ID),
            contract_type: scalar(fields::CONTRACT_TYPE),
            client_name: scalar(fields::CLIENT_NAME),
            maid_name: scalar(fields::MAID_NAME),
            record_ids: entity.record_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OecSalesReport {
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// One sale per merged period starting inside the range.
    pub total_sales: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_contract_type: BTreeMap<String, usize>,
    /// Household-deduplicated view, one category per sale type.
    pub summary: Summary,
    pub sales: Vec<SaleRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplaintReport {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub total_complaints: usize,
    /// Household-deduplicated counts per complaint type.
    pub by_type: BTreeMap<String, CategoryCount>,
    pub summary: Summary,
    pub complaints: Vec<SaleRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlLine {
    pub kind: String,
    pub name: String,
    pub count: usize,
    pub unit_revenue: f64,
    pub unit_cost: f64,
    pub revenue: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlReport {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub currency: String,
    pub lines: Vec<PnlLine>,
    pub revenue: f64,
    pub cost: f64,
    pub margin: f64,
}

fn entity_type(entity: &MergedEntity) -> String {
    entity
        .categories
        .first()
        .cloned()
        .unwrap_or_else(|| UNTYPED.to_string())
}

fn upload_prefix(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::OecSale => OEC_PREFIX,
        SourceKind::Complaint => COMPLAINTS_PREFIX,
        SourceKind::Conversation => crate::daily::DAILY_PREFIX,
    }
}

fn upload_key(kind: SourceKind, date: &str) -> String {
    format!("{}{date}.json", upload_prefix(kind))
}

/// One category per distinct entity type, counted by household.
fn summarize_by_type(entities: &[MergedEntity]) -> Summary {
    let mut types = entities.iter().map(entity_type).collect::<Vec<_>>();
    types.sort();
    types.dedup();
    let rules = types
        .iter()
        .map(|name| CategoryRule {
            name: name.clone(),
            when: if name == UNTYPED {
                Predicate::Not {
                    predicate: Box::new(Predicate::CategoryContains {
                        contains: String::new(),
                    }),
                }
            } else {
                Predicate::category(name)
            },
            converted: None,
        })
        .collect::<Vec<_>>();
    aggregate_with(
        entities,
        &rules,
        |e| household_key(e, fields::CONTRACT_ID),
        |e| e.scalar(fields::CONTRACT_TYPE).map(ToString::to_string),
        &[fields::COUNTRIES.to_string()],
    )
}

impl Dashboard {
    pub async fn upload_oec_rows(&self, date: &str, rows: &[JsonValue]) -> Result<UploadReport, DashboardError> {
        self.upload_rows(SourceKind::OecSale, date, rows).await
    }

    pub async fn upload_complaints(&self, date: &str, rows: &[JsonValue]) -> Result<UploadReport, DashboardError> {
        self.upload_rows(SourceKind::Complaint, date, rows).await
    }

    async fn upload_rows(
        &self,
        kind: SourceKind,
        date: &str,
        rows: &[JsonValue],
    ) -> Result<UploadReport, DashboardError> {
        let date = canonical_date(date)?;
        let events = adapter_for(kind).normalize_rows(rows)?;
        let key = upload_key(kind, &date);

        let _guard = self.locks.write_guard(&key).await;
        let now = Utc::now();
        let mut batch = get_json::<UploadBatch>(self.store.as_ref(), &key)
            .await?
            .unwrap_or_else(|| UploadBatch {
                date: date.clone(),
                kind,
                updated_at: now,
                events: Vec::new(),
            });

        let id_of = |event: &RawEvent| {
            event
                .record_id()
                .map(ToString::to_string)
                .unwrap_or_else(|| resolve_identity(event).to_string())
        };
        let mut known = batch.events.iter().map(id_of).collect::<HashSet<_>>();
        let (mut added, mut duplicates) = (0, 0);
        for event in events {
            if !known.insert(id_of(&event)) {
                duplicates += 1;
                continue;
            }
            batch.events.push(event);
            added += 1;
        }
        batch.updated_at = now;
        put_json(self.store.as_ref(), &key, &batch).await?;

        info!(%date, kind = kind.as_str(), added, duplicates, "stored uploaded rows");
        Ok(UploadReport {
            date,
            kind,
            received: rows.len(),
            added,
            duplicates,
            total_rows: batch.events.len(),
        })
    }

    /// Every uploaded event of `kind` dated on or before `to`.
    async fn uploaded_events(&self, kind: SourceKind, to: NaiveDate) -> Result<Vec<RawEvent>, DashboardError> {
        let mut events = Vec::new();
        for key in self.store.list(upload_prefix(kind)).await? {
            let Some(batch) = get_json::<UploadBatch>(self.store.as_ref(), &key).await? else {
                continue;
            };
            events.extend(
                batch
                    .events
                    .into_iter()
                    .filter(|e| e.timestamp.map_or(true, |t| t.date_naive() <= to)),
            );
        }
        debug!(kind = kind.as_str(), events = events.len(), "loaded uploaded events");
        Ok(events)
    }

    /// Merge the full history so periods that began before `from` keep
    /// absorbing their follow-up rows, then keep periods starting in range.
    async fn merged_in_range(
        &self,
        kind: SourceKind,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MergedEntity>, DashboardError> {
        let events = self.uploaded_events(kind, to).await?;
        Ok(MergeProfile::for_source(kind)
            .merge(events, Utc::now())
            .into_iter()
            .filter(|e| {
                let day = e.start_time.date_naive();
                day >= from && day <= to
            })
            .collect())
    }

    pub async fn oec_sales_report(&self, from: &str, to: &str) -> Result<OecSalesReport, DashboardError> {
        let (from, to) = date_range(from, to)?;
        let sales = self.merged_in_range(SourceKind::OecSale, from, to).await?;

        let mut by_type = BTreeMap::new();
        let mut by_contract_type = BTreeMap::new();
        for sale in &sales {
            *by_type.entry(entity_type(sale)).or_insert(0) += 1;
            if let Some(contract_type) = sale.scalar(fields::CONTRACT_TYPE) {
                *by_contract_type.entry(contract_type.to_string()).or_insert(0) += 1;
            }
        }

        Ok(OecSalesReport {
            from,
            to,
            total_sales: sales.len(),
            by_type,
            by_contract_type,
            summary: summarize_by_type(&sales),
            sales: sales.iter().map(SaleRow::from_entity).collect(),
        })
    }

    pub async fn complaint_report(&self, from: &str, to: &str) -> Result<ComplaintReport, DashboardError> {
        let (from, to) = date_range(from, to)?;
        let complaints = self.merged_in_range(SourceKind::Complaint, from, to).await?;
        let summary = summarize_by_type(&complaints);
        Ok(ComplaintReport {
            from,
            to,
            total_complaints: complaints.len(),
            by_type: summary.categories.clone(),
            summary,
            complaints: complaints.iter().map(SaleRow::from_entity).collect(),
        })
    }

    /// Sales revenue minus sale and complaint costs for the range.
    pub async fn pnl_report(&self, from: &str, to: &str) -> Result<PnlReport, DashboardError> {
        let config = self.effective_pnl().await?;
        let sales = self.oec_sales_report(from, to).await?;
        let complaints = self.complaint_report(from, to).await?;

        let mut lines = Vec::new();
        for (name, count) in &sales.by_type {
            let economics = config.sale_economics(name).unwrap_or_default();
            lines.push(PnlLine {
                kind: "sale".to_string(),
                name: name.clone(),
                count: *count,
                unit_revenue: economics.unit_revenue,
                unit_cost: economics.unit_cost,
                revenue: economics.unit_revenue * *count as f64,
                cost: economics.unit_cost * *count as f64,
            });
        }
        for (name, counts) in &complaints.by_type {
            let unit_cost = config.complaint_cost(name);
            lines.push(PnlLine {
                kind: "complaint".to_string(),
                name: name.clone(),
                count: counts.total,
                unit_revenue: 0.0,
                unit_cost,
                revenue: 0.0,
                cost: unit_cost * counts.total as f64,
            });
        }

        let revenue = lines.iter().map(|l| l.revenue).sum::<f64>();
        let cost = lines.iter().map(|l| l.cost).sum::<f64>();
        Ok(PnlReport {
            from: sales.from,
            to: sales.to,
            currency: config.currency,
            lines,
            revenue,
            cost,
            margin: revenue - cost,
        })
    }
}

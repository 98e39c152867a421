//! Parquet export of merged OEC sales.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::reports::{OecSalesReport, SaleRow};
use crate::Dashboard;

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub from: String,
    pub to: String,
    pub total_sales: usize,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

impl Dashboard {
    /// Write `sales.parquet` and `manifest.json` under `out_dir`; returns the
    /// manifest path.
    pub async fn export_oec_sales(&self, from: &str, to: &str, out_dir: &Path) -> Result<PathBuf> {
        let report = self
            .oec_sales_report(from, to)
            .await
            .context("building OEC sales report")?;
        export_report(&report, out_dir).await
    }
}

pub async fn export_report(report: &OecSalesReport, out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let sales_path = out_dir.join("sales.parquet");
    write_sales_parquet(&sales_path, &report.sales)?;

    let manifest = ExportManifest {
        schema_version: 1,
        from: report.from.to_string(),
        to: report.to.to_string(),
        total_sales: report.total_sales,
        files: vec![manifest_entry("sales", out_dir, &sales_path)?],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(sales = report.total_sales, path = %manifest_path.display(), "exported OEC sales");
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_sales_parquet(path: &Path, sales: &[SaleRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("sale_key", DataType::Utf8, false),
        ArrowField::new("sale_type", DataType::Utf8, false),
        ArrowField::new("start_time", DataType::Utf8, false),
        ArrowField::new("end_time", DataType::Utf8, false),
        ArrowField::new("events", DataType::UInt32, false),
        ArrowField::new("contract_id", DataType::Utf8, true),
        ArrowField::new("contract_type", DataType::Utf8, true),
        ArrowField::new("client_name", DataType::Utf8, true),
        ArrowField::new("maid_name", DataType::Utf8, true),
    ]));

    let keys = StringArray::from(sales.iter().map(|s| Some(s.key.as_str())).collect::<Vec<_>>());
    let types = StringArray::from(
        sales
            .iter()
            .map(|s| Some(s.sale_type.as_str()))
            .collect::<Vec<_>>(),
    );
    let starts = StringArray::from(
        sales
            .iter()
            .map(|s| Some(s.start_time.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let ends = StringArray::from(
        sales
            .iter()
            .map(|s| Some(s.end_time.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let events = UInt32Array::from(
        sales
            .iter()
            .map(|s| u32::try_from(s.events).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let contract_ids = StringArray::from(sales.iter().map(|s| s.contract_id.as_deref()).collect::<Vec<_>>());
    let contract_types = StringArray::from(sales.iter().map(|s| s.contract_type.as_deref()).collect::<Vec<_>>());
    let client_names = StringArray::from(sales.iter().map(|s| s.client_name.as_deref()).collect::<Vec<_>>());
    let maid_names = StringArray::from(sales.iter().map(|s| s.maid_name.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(types),
            Arc::new(starts),
            Arc::new(ends),
            Arc::new(events),
            Arc::new(contract_ids),
            Arc::new(contract_types),
            Arc::new(client_names),
            Arc::new(maid_names),
        ],
    )
    .context("building sales record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use opsdash_core::Summary;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn export_writes_parquet_and_a_hashed_manifest() {
        let at = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).single().unwrap();
        let report = OecSalesReport {
            from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            total_sales: 1,
            by_type: BTreeMap::new(),
            by_contract_type: BTreeMap::new(),
            summary: Summary::default(),
            sales: vec![SaleRow {
                key: "overseas employment certificate/client:C-1".into(),
                sale_type: "Overseas Employment Certificate".into(),
                start_time: at,
                end_time: at,
                events: 2,
                contract_id: None,
                contract_type: Some("CC".into()),
                client_name: Some("Amal".into()),
                maid_name: None,
                record_ids: vec!["s-1".into(), "s-2".into()],
            }],
        };

        let dir = tempfile::tempdir().unwrap();
        let manifest_path = export_report(&report, dir.path()).await.unwrap();
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();

        let file = &manifest["files"][0];
        assert_eq!(file["path"], "sales.parquet");
        assert_eq!(file["sha256"].as_str().unwrap().len(), 64);
        assert!(dir.path().join("sales.parquet").exists());
        assert_eq!(manifest["total_sales"], 1);
    }
}

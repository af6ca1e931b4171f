//! Volume and disk metrics of the `lvm` driver, sampled with `sar -dp`.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{DRIVER_NAME, LvmDriver, VOLUME_PREFIX};
use crate::error::DockError;
use crate::metric::Metric;
use crate::model::{Component, MetricName, MetricSpec, MetricValue};

/// `sar` column per metric. Older sysstat lacks `rkB/s` and reports sectors.
const COLUMNS: [(MetricName, &[&str]); 6] = [
    (MetricName::Iops, &["tps"]),
    (MetricName::ReadThroughput, &["rkB/s", "rd_sec/s"]),
    (MetricName::WriteThroughput, &["wkB/s", "wr_sec/s"]),
    (MetricName::ResponseTime, &["await"]),
    (MetricName::ServiceTime, &["svctm"]),
    (MetricName::Utilization, &["%util"]),
];

type SarRows = HashMap<String, HashMap<String, f64>>;

/// Device-mapper name of an LV: dashes inside each part are doubled.
pub(crate) fn dm_name(vg: &str, lv: &str) -> String {
    format!("{}-{}", vg.replace('-', "--"), lv.replace('-', "--"))
}

/// Per-device columns of `sar -dp` output. Later rows (the `Average:` block)
/// replace earlier ones.
pub(crate) fn parse_sar(out: &str) -> SarRows {
    let mut rows = SarRows::new();
    let mut header: Vec<String> = Vec::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let Some(pos) = fields.iter().position(|f| *f == "DEV") {
            header = fields[pos + 1..].iter().map(|s| (*s).to_owned()).collect();
            continue;
        }
        if header.is_empty() || fields.len() < header.len() + 1 {
            continue;
        }
        let values = &fields[fields.len() - header.len()..];
        let dev = fields[fields.len() - header.len() - 1];
        let mut row = HashMap::new();
        for (name, raw) in header.iter().zip(values) {
            if let Ok(v) = raw.replace(',', ".").parse::<f64>() {
                row.insert(name.clone(), v);
            }
        }
        if !row.is_empty() {
            rows.insert(dev.to_owned(), row);
        }
    }
    rows
}

fn column_value(row: &HashMap<String, f64>, columns: &[&str]) -> Option<f64> {
    columns.iter().find_map(|col| {
        let v = row.get(*col)?;
        // Sectors are 512 bytes.
        Some(if col.ends_with("_sec/s") { v / 2.0 } else { *v })
    })
}

fn samples(
    row: &HashMap<String, f64>,
    component: Component,
    instance_id: &str,
    instance_name: &str,
    device: &str,
    timestamp: i64,
) -> Vec<MetricSpec> {
    COLUMNS
        .iter()
        .filter_map(|(name, columns)| {
            let value = column_value(row, columns)?;
            Some(MetricSpec {
                instance_id: instance_id.to_owned(),
                instance_name: instance_name.to_owned(),
                job: DRIVER_NAME.to_owned(),
                labels: HashMap::from([("device".to_owned(), device.to_owned())]),
                component,
                name: *name,
                unit: name.unit(),
                aggr_type: String::new(),
                metric_values: vec![MetricValue { timestamp, value }],
            })
        })
        .collect()
}

#[async_trait]
impl Metric for LvmDriver {
    async fn setup_metrics(&self) -> Result<(), DockError> {
        self.session()?
            .cli
            .run("sar", &["-V"])
            .await
            .map(|_| ())
            .map_err(|e| DockError::Config(format!("sysstat is unavailable: {e}")))
    }

    async fn get_metric_list(&self, resource_type: &str) -> Result<Vec<MetricName>, DockError> {
        match resource_type {
            "volume" | "disk" => Ok(MetricName::ALL.to_vec()),
            other => Err(DockError::Validation(format!(
                "no metrics for resource type {other:?}"
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn collect_metrics(&self) -> Result<Vec<MetricSpec>, DockError> {
        let session = self.session()?;
        let rows = parse_sar(&session.cli.run("sar", &["-dp", "1", "1"]).await?);
        let timestamp = chrono::Utc::now().timestamp();
        let mut specs = Vec::new();

        for lv in session.cli.list_lvs(None).await? {
            if !session.conf.pool.contains_key(&lv.vg) {
                continue;
            }
            let Some(id) = lv.name.strip_prefix(VOLUME_PREFIX) else {
                continue;
            };
            let dm = dm_name(&lv.vg, &lv.name);
            match rows.get(&dm) {
                Some(row) => specs.extend(samples(row, Component::Volume, id, &lv.name, &dm, timestamp)),
                None => debug!(device = %dm, "no sar row for volume"),
            }
        }

        for pv in session.cli.list_pvs().await? {
            let dev = pv.rsplit('/').next().unwrap_or(&pv);
            if let Some(row) = rows.get(dev) {
                specs.extend(samples(row, Component::Disk, dev, &pv, dev, timestamp));
            }
        }
        Ok(specs)
    }
}

//! Metric collection capability.

use async_trait::async_trait;

use crate::error::DockError;
use crate::model::{MetricName, MetricSpec};

#[async_trait]
pub trait Metric: Send + Sync {
    /// Prepare collection; called once per backend before the first collect.
    async fn setup_metrics(&self) -> Result<(), DockError> {
        Ok(())
    }

    async fn teardown_metrics(&self) -> Result<(), DockError> {
        Ok(())
    }

    /// Metrics supported for a resource type (`volume`, `disk`).
    async fn get_metric_list(&self, resource_type: &str) -> Result<Vec<MetricName>, DockError>;

    /// One sample of every supported metric. Safe to call concurrently.
    async fn collect_metrics(&self) -> Result<Vec<MetricSpec>, DockError>;
}

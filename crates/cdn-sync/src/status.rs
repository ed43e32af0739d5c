//! Health lines for the whole storage core.

use cdn_types::MonitoringStatusLine;
use cdn_store::StorageUnit;

use crate::engine::SyncEngine;

impl SyncEngine {
    /// Unit reachability, per-target backlog, and one alert per pair that
    /// needs attention. Each unit probe is bounded by the configured timeout.
    pub async fn status(&self) -> Vec<MonitoringStatusLine> {
        let mut lines = Vec::new();
        let units = std::iter::once(&self.buffer).chain(self.targets());
        for unit in units {
            lines.extend(self.unit_status(unit.as_ref()).await);
        }

        match self.metadata.items_in_unit(self.buffer.id()).await {
            Ok(held) => lines.push(MonitoringStatusLine::ok(
                format!("buffer/{}", self.buffer.id()),
                format!("{} items held", held.len()),
            )),
            Err(e) => lines.push(MonitoringStatusLine::alert("metadata", e.to_string())),
        }

        for target in self.targets() {
            let component = format!("sync/{}", target.id());
            match self
                .metadata
                .items_missing_from(self.buffer.id(), target.id())
                .await
            {
                Ok(missing) if missing.is_empty() => {
                    lines.push(MonitoringStatusLine::ok(component, "0 items pending"))
                }
                Ok(missing) => lines.push(MonitoringStatusLine::warn(
                    component,
                    format!("{} items pending", missing.len()),
                )),
                Err(e) => lines.push(MonitoringStatusLine::alert(component, e.to_string())),
            }
        }

        match self.metadata.failures().await {
            Ok(failures) => {
                for f in failures.into_iter().filter(|f| f.needs_attention) {
                    lines.push(MonitoringStatusLine::alert(
                        format!("sync/{}/{}", f.unit_id, f.item_id),
                        format!("failed after {} attempts: {}", f.attempts, f.last_error),
                    ));
                }
            }
            Err(e) => lines.push(MonitoringStatusLine::alert("metadata", e.to_string())),
        }
        lines
    }

    async fn unit_status(&self, unit: &dyn StorageUnit) -> Vec<MonitoringStatusLine> {
        match tokio::time::timeout(self.config.status_timeout(), unit.status()).await {
            Ok(lines) => lines,
            Err(_) => vec![MonitoringStatusLine::alert(
                format!("unit/{}", unit.id()),
                "status probe timed out",
            )],
        }
    }
}

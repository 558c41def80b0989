//! `cluster.version`: report the server version through a pooled DB handle.

use async_trait::async_trait;

use crate::framework::check::report::TaskReport;
use crate::framework::check::task::{DiagnosticTask, TaskContext, TaskError, TaskInfo};
use crate::infrastructure::connection::db::parse_json_rows;
use crate::infrastructure::connection::db_pool::DbLease;

pub fn factory() -> Box<dyn DiagnosticTask> {
    Box::new(ClusterVersionTask { lease: None })
}

struct ClusterVersionTask {
    lease: Option<DbLease>,
}

#[derive(serde::Deserialize)]
struct VersionRow {
    version: String,
}

#[async_trait]
impl DiagnosticTask for ClusterVersionTask {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            name: "cluster.version",
            description: "Report the server version the cluster is running",
            supported_os: None,
        }
    }

    async fn init(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        self.lease = Some(ctx.connections.acquire_db().await?);
        Ok(())
    }

    async fn execute(
        &mut self,
        ctx: &TaskContext,
        report: &mut TaskReport,
    ) -> Result<(), TaskError> {
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| TaskError::Precondition("no db handle leased".to_string()))?;

        let body = lease
            .execute_sql("SELECT version() AS version FORMAT JSON")
            .await?;
        let rows: Vec<VersionRow> = parse_json_rows(&body)?;
        let reported = rows
            .into_iter()
            .next()
            .map(|row| row.version)
            .ok_or_else(|| TaskError::Precondition("version query returned no rows".to_string()))?;

        report.add_info(format!("server version {reported}"));
        if let Some(expected) = &ctx.version {
            if expected != &reported {
                report.add_warning(format!(
                    "version changed mid-run: was {expected}, now {reported}"
                ));
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &TaskContext) {
        if let Some(lease) = self.lease.take() {
            ctx.connections.release_db(lease).await;
        }
    }
}

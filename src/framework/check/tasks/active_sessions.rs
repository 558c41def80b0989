//! `db.active_sessions`: warn when the cluster is handling an unusually
//! large number of concurrent sessions.

use async_trait::async_trait;

use crate::framework::check::report::TaskReport;
use crate::framework::check::task::{DiagnosticTask, TaskContext, TaskError, TaskInfo};
use crate::infrastructure::connection::db_pool::DbLease;

const SESSION_WARN_THRESHOLD: u64 = 512;

pub fn factory() -> Box<dyn DiagnosticTask> {
    Box::new(ActiveSessionsTask { lease: None })
}

struct ActiveSessionsTask {
    lease: Option<DbLease>,
}

/// Parse the `FORMAT JSON` body of the session-count query. Numeric columns
/// may arrive as JSON numbers or as quoted strings depending on the server's
/// integer rendering, so both are accepted.
fn parse_session_count(body: &str) -> anyhow::Result<u64> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    let cell = value
        .get("data")
        .and_then(|data| data.get(0))
        .and_then(|row| row.get("sessions"))
        .ok_or_else(|| anyhow::anyhow!("session count query returned no rows"))?;

    match cell {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("session count is not a non-negative integer: {n}")),
        serde_json::Value::String(s) => Ok(s.parse()?),
        other => anyhow::bail!("unexpected session count value: {other}"),
    }
}

#[async_trait]
impl DiagnosticTask for ActiveSessionsTask {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            name: "db.active_sessions",
            description: "Count active sessions and warn when the cluster looks overloaded",
            supported_os: None,
        }
    }

    async fn init(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        self.lease = Some(ctx.connections.acquire_db().await?);
        Ok(())
    }

    async fn execute(
        &mut self,
        _ctx: &TaskContext,
        report: &mut TaskReport,
    ) -> Result<(), TaskError> {
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| TaskError::Precondition("no db handle leased".to_string()))?;

        let body = lease
            .execute_sql("SELECT count() AS sessions FROM system.processes FORMAT JSON")
            .await?;
        let sessions = parse_session_count(&body)?;

        if sessions > SESSION_WARN_THRESHOLD {
            report.add_warning(format!(
                "{sessions} active sessions (threshold {SESSION_WARN_THRESHOLD})"
            ));
        } else {
            report.add_info(format!("{sessions} active sessions"));
        }
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &TaskContext) {
        if let Some(lease) = self.lease.take() {
            ctx.connections.release_db(lease).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_string_counts() {
        let numeric = r#"{"data":[{"sessions":42}]}"#;
        assert_eq!(parse_session_count(numeric).unwrap(), 42);

        let quoted = r#"{"data":[{"sessions":"1024"}]}"#;
        assert_eq!(parse_session_count(quoted).unwrap(), 1024);
    }

    #[test]
    fn rejects_empty_and_malformed_bodies() {
        assert!(parse_session_count(r#"{"data":[]}"#).is_err());
        assert!(parse_session_count(r#"{"data":[{"sessions":-3}]}"#).is_err());
        assert!(parse_session_count("not json").is_err());
    }
}

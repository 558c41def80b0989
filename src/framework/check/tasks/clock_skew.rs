//! `node.clock_skew`: compare each node's clock against the local one.
//!
//! Skewed clocks break distributed timestamps long before anything else
//! complains, so this warns well below the level at which the cluster would
//! visibly misbehave.

use async_trait::async_trait;
use chrono::Utc;

use crate::framework::check::report::TaskReport;
use crate::framework::check::task::{DiagnosticTask, TaskContext, TaskError, TaskInfo};
use crate::infrastructure::connection::manager::Node;

const MAX_SKEW_SECS: i64 = 3;

pub fn factory() -> Box<dyn DiagnosticTask> {
    Box::new(ClockSkewTask { nodes: Vec::new() })
}

struct ClockSkewTask {
    nodes: Vec<Node>,
}

fn parse_epoch_seconds(stdout: &str) -> anyhow::Result<i64> {
    let trimmed = stdout.trim();
    trimmed
        .parse()
        .map_err(|e| anyhow::anyhow!("unexpected `date +%s` output {trimmed:?}: {e}"))
}

#[async_trait]
impl DiagnosticTask for ClockSkewTask {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            name: "node.clock_skew",
            description: "Compare node clocks against the local clock",
            supported_os: Some(&["linux"]),
        }
    }

    async fn init(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        self.nodes = ctx.connections.setup_nodes(&ctx.cluster.nodes).await;
        Ok(())
    }

    async fn execute(
        &mut self,
        _ctx: &TaskContext,
        report: &mut TaskReport,
    ) -> Result<(), TaskError> {
        for node in &self.nodes {
            let node_name = node.config.key().to_string();
            let Some(session) = &node.connection else {
                report.add_warning(format!("{node_name}: unreachable, skipped"));
                continue;
            };

            let output = match session.exec("date +%s").await {
                Ok(output) => output,
                Err(e) => {
                    report.add_warning(format!("{node_name}: could not read clock: {e}"));
                    continue;
                }
            };

            let remote = match parse_epoch_seconds(&output.stdout) {
                Ok(remote) => remote,
                Err(e) => {
                    report.add_warning(format!("{node_name}: {e}"));
                    continue;
                }
            };

            let skew = remote - Utc::now().timestamp();
            if skew.abs() > MAX_SKEW_SECS {
                report.add_warning(format!(
                    "{node_name}: clock skewed by {skew}s (limit {MAX_SKEW_SECS}s)"
                ));
            }
        }
        if self.nodes.is_empty() {
            report.add_info("no nodes configured");
        }
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &TaskContext) {
        ctx.connections
            .teardown_nodes(std::mem::take(&mut self.nodes))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_epoch_output() {
        assert_eq!(parse_epoch_seconds("1724576000\n").unwrap(), 1724576000);
        assert!(parse_epoch_seconds("Tue Aug 25").is_err());
        assert!(parse_epoch_seconds("").is_err());
    }
}

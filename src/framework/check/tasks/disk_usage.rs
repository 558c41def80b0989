//! `node.disk_usage`: flag filesystems running out of space on each node.

use async_trait::async_trait;

use crate::framework::check::report::TaskReport;
use crate::framework::check::task::{DiagnosticTask, TaskContext, TaskError, TaskInfo};
use crate::infrastructure::connection::manager::Node;

const WARN_USE_PERCENT: u8 = 85;
const FAIL_USE_PERCENT: u8 = 95;

pub fn factory() -> Box<dyn DiagnosticTask> {
    Box::new(DiskUsageTask { nodes: Vec::new() })
}

struct DiskUsageTask {
    nodes: Vec<Node>,
}

#[derive(Debug, PartialEq, Eq)]
struct MountUsage {
    mount: String,
    use_percent: u8,
}

/// Parse POSIX `df -P -k` output. The header line and anything that does not
/// look like a data row is ignored; long device names wrapped onto their own
/// line by non-POSIX df are skipped rather than misread.
fn parse_df(output: &str) -> Vec<MountUsage> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            let use_percent = fields[4].strip_suffix('%')?.parse().ok()?;
            Some(MountUsage {
                mount: fields[5..].join(" "),
                use_percent,
            })
        })
        .collect()
}

fn report_node(report: &mut TaskReport, node_name: &str, mounts: &[MountUsage]) {
    for mount in mounts {
        if mount.use_percent > FAIL_USE_PERCENT {
            report.add_fail(format!(
                "{node_name}: {} at {}% (limit {FAIL_USE_PERCENT}%)",
                mount.mount, mount.use_percent
            ));
        } else if mount.use_percent > WARN_USE_PERCENT {
            report.add_warning(format!(
                "{node_name}: {} at {}% (limit {WARN_USE_PERCENT}%)",
                mount.mount, mount.use_percent
            ));
        }
    }
}

#[async_trait]
impl DiagnosticTask for DiskUsageTask {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            name: "node.disk_usage",
            description: "Check filesystem usage on every cluster node",
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

            match session.exec("df -P -k").await {
                Ok(output) => report_node(report, &node_name, &parse_df(&output.stdout)),
                Err(e) => report.add_warning(format!("{node_name}: df failed: {e}")),
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

    const DF_OUTPUT: &str = "\
Filesystem     1024-blocks      Used Available Capacity Mounted on
/dev/vda1         51474912  14000000  34838528      29% /
/dev/vdb1        515010816 499999999   5010817      97% /data
tmpfs             16328500         0  16328500       0% /dev/shm
";

    #[test]
    fn parses_posix_df_rows() {
        let mounts = parse_df(DF_OUTPUT);
        assert_eq!(mounts.len(), 3);
        assert_eq!(
            mounts[1],
            MountUsage {
                mount: "/data".to_string(),
                use_percent: 97
            }
        );
    }

    #[test]
    fn ignores_short_and_malformed_lines() {
        let output = "header\n/dev/vda1 100 50\nnot a df line at all\n";
        assert!(parse_df(output).is_empty());
    }

    #[test]
    fn thresholds_split_warn_and_fail() {
        let mut report = TaskReport::new("node.disk_usage");
        report_node(
            &mut report,
            "ssh:10.0.0.1:22",
            &[
                MountUsage {
                    mount: "/".to_string(),
                    use_percent: 29,
                },
                MountUsage {
                    mount: "/logs".to_string(),
                    use_percent: 90,
                },
                MountUsage {
                    mount: "/data".to_string(),
                    use_percent: 97,
                },
            ],
        );

        use crate::framework::check::report::TaskStatus;
        assert_eq!(report.status, TaskStatus::Fail);
        assert_eq!(report.messages.len(), 2);
        assert!(report.messages[0].contains("/logs at 90%"));
        assert!(report.messages[1].contains("/data at 97%"));
    }
}

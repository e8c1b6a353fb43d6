use std::time::Duration;

use serde::Serialize;

use kiln_scheduler::{GroupResults, SchedulerMetrics};

/// Errors listed per failed group before the rest is elided.
const MAX_ERRORS_SHOWN: usize = 5;

#[derive(Debug, Serialize)]
pub struct GroupSummary {
    pub group: u64,
    pub jobs: usize,
    pub failed: usize,
    pub all_succeeded: bool,
    pub errors: Vec<String>,
}

impl GroupSummary {
    pub fn from_results(results: &GroupResults) -> Self {
        let errors = results
            .failed_jobs()
            .flat_map(|job| {
                job.errors()
                    .iter()
                    .map(move |e| format!("job {} ({}): {e}", job.id(), job.worker_type()))
            })
            .collect();
        Self {
            group: results.group.0,
            jobs: results.jobs.len(),
            failed: results.jobs.len() - results.succeeded_count(),
            all_succeeded: results.all_succeeded,
            errors,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub groups: Vec<GroupSummary>,
    pub elapsed_ms: u64,
    pub metrics: SchedulerMetrics,
}

impl Report {
    pub fn new(results: &[GroupResults], elapsed: Duration, metrics: SchedulerMetrics) -> Self {
        let mut groups: Vec<GroupSummary> = results.iter().map(GroupSummary::from_results).collect();
        groups.sort_by_key(|g| g.group);
        Self {
            groups,
            elapsed_ms: elapsed.as_millis() as u64,
            metrics,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.groups.iter().all(|g| g.all_succeeded)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for g in &self.groups {
            let status = if g.all_succeeded { "ok" } else { "FAILED" };
            out.push_str(&format!(
                "group {:>6}  {:>4} jobs  {:>4} failed  {status}\n",
                g.group, g.jobs, g.failed
            ));
            for e in g.errors.iter().take(MAX_ERRORS_SHOWN) {
                out.push_str(&format!("    {e}\n"));
            }
            if g.errors.len() > MAX_ERRORS_SHOWN {
                out.push_str(&format!("    ... {} more\n", g.errors.len() - MAX_ERRORS_SHOWN));
            }
        }
        let failed_groups = self.groups.iter().filter(|g| !g.all_succeeded).count();
        out.push_str(&format!(
            "{} groups, {} failed, {} batches, {} worker launches, {} lost batches in {} ms\n",
            self.groups.len(),
            failed_groups,
            self.metrics.batches_sent,
            self.metrics.worker_launches,
            self.metrics.lost_batches,
            self.elapsed_ms
        ));
        out
    }
}

//! SLA scan over open manual-review tasks.
//!
//! Stateless: an overdue task is alerted on every run until it leaves the
//! open statuses.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::channels::SlackNotifier;
use crate::error::DatabaseError;
use crate::store::Database;
use crate::store::model::{ManualReviewTask, ReviewPriority};

/// Minutes a task of the given priority may stay open.
pub fn sla_minutes(priority: ReviewPriority) -> i64 {
    match priority {
        ReviewPriority::P0 => 15,
        ReviewPriority::P1 => 30,
        ReviewPriority::P2 => 240,
    }
}

/// Whether the task has been open longer than its threshold at `now`.
pub fn is_overdue(task: &ManualReviewTask, now: DateTime<Utc>) -> bool {
    now - task.created_at > Duration::minutes(sla_minutes(task.priority))
}

fn format_alert(task: &ManualReviewTask, now: DateTime<Utc>) -> String {
    let elapsed = (now - task.created_at).num_minutes();
    format!(
        "*SLA breach* manual review {} ({})\nEmail ID: {}\nStatus: {}\nOpen for {} min (limit {} min)",
        task.id,
        task.priority.as_str(),
        task.email_id,
        task.status.as_str(),
        elapsed,
        sla_minutes(task.priority),
    )
}

pub struct SlaScanner {
    db: Arc<dyn Database>,
    slack: Option<SlackNotifier>,
}

impl SlaScanner {
    pub fn new(db: Arc<dyn Database>, slack: Option<SlackNotifier>) -> Self {
        Self { db, slack }
    }

    pub async fn run(&self) -> Result<usize, DatabaseError> {
        self.run_at(Utc::now()).await
    }

    /// Alert on every open task overdue at `now`. Returns the overdue count.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let open = self.db.list_open_manual_reviews().await?;
        let overdue: Vec<&ManualReviewTask> =
            open.iter().filter(|task| is_overdue(task, now)).collect();

        for task in &overdue {
            let elapsed = (now - task.created_at).num_minutes();
            match &self.slack {
                Some(slack) => {
                    if let Err(e) = slack.post(&format_alert(task, now)).await {
                        warn!(task_id = %task.id, error = %e, "SLA alert failed");
                    }
                }
                None => warn!(
                    task_id = %task.id,
                    email_id = %task.email_id,
                    priority = task.priority.as_str(),
                    elapsed_minutes = elapsed,
                    "Manual review overdue"
                ),
            }
        }

        if !overdue.is_empty() {
            info!(overdue = overdue.len(), open = open.len(), "SLA scan finished");
        }
        Ok(overdue.len())
    }
}

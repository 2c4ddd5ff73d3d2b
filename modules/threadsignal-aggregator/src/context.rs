// Per-operation fetch state. One FetchContext exists per Aggregate() call and
// is threaded through every fetcher call; nothing here is process-global.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use threadsignal_common::{SkipReason, ThreadError};

use crate::transport::RequestBudget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Duplicate,
    /// The node ceiling is reached; stop collecting.
    Full,
}

pub struct FetchContext {
    budget: RequestBudget,
    max_nodes: Option<usize>,
    from_date: Option<DateTime<Utc>>,
    concurrency: usize,
    seen: Mutex<HashSet<String>>,
    skipped: Mutex<Vec<SkipReason>>,
    collected: AtomicUsize,
    ceiling_recorded: AtomicBool,
    interruption_recorded: AtomicBool,
}

impl FetchContext {
    pub fn new(budget: RequestBudget, concurrency: usize) -> Self {
        Self {
            budget,
            max_nodes: None,
            from_date: None,
            concurrency: concurrency.max(1),
            seen: Mutex::new(HashSet::new()),
            skipped: Mutex::new(Vec::new()),
            collected: AtomicUsize::new(0),
            ceiling_recorded: AtomicBool::new(false),
            interruption_recorded: AtomicBool::new(false),
        }
    }

    pub fn with_max_nodes(mut self, max_nodes: Option<usize>) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_from_date(mut self, from_date: Option<DateTime<Utc>>) -> Self {
        self.from_date = from_date;
        self
    }

    pub fn budget(&self) -> &RequestBudget {
        &self.budget
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.budget.cancel_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.budget.cancel_token().is_cancelled()
    }

    pub fn from_date(&self) -> Option<DateTime<Utc>> {
        self.from_date
    }

    /// Fan-out concurrency cap for this operation.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Reply nodes accepted so far.
    pub fn collected(&self) -> usize {
        self.collected.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.max_nodes
            .is_some_and(|max| self.collected.load(Ordering::SeqCst) >= max)
    }

    /// Whether collection should stop: cancelled or at the ceiling.
    pub fn should_stop(&self) -> bool {
        if self.is_cancelled() {
            self.record_cancelled();
            return true;
        }
        if self.is_full() {
            self.record_ceiling();
            return true;
        }
        false
    }

    /// Mark an id as seen. Returns false if it already was.
    pub fn mark_seen(&self, id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string())
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(id)
    }

    /// Claim one slot under the node ceiling.
    pub fn reserve_slot(&self) -> bool {
        let claimed = self
            .collected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match self.max_nodes {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            })
            .is_ok();
        if !claimed {
            self.record_ceiling();
        }
        claimed
    }

    /// Deduplicate then count a node.
    pub fn admit(&self, id: &str) -> Admission {
        if self.is_full() {
            self.record_ceiling();
            return Admission::Full;
        }
        if !self.mark_seen(id) {
            return Admission::Duplicate;
        }
        if self.reserve_slot() {
            Admission::Accepted
        } else {
            Admission::Full
        }
    }

    pub fn record(&self, reason: SkipReason) {
        warn!(reason = %reason, "Thread may be incomplete");
        self.skipped
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(reason);
    }

    /// Record an error that cut pagination or fan-out short. Rate limiting
    /// and cancellation are recorded once per operation.
    pub fn record_interruption(&self, err: &ThreadError) {
        match err {
            ThreadError::Cancelled => self.record_cancelled(),
            ThreadError::RateLimited { retry_after, .. } => {
                if !self.interruption_recorded.swap(true, Ordering::SeqCst) {
                    self.record(SkipReason::RateLimited {
                        processed: self.collected(),
                        retry_after_secs: retry_after.map(|d| d.as_secs()),
                    });
                }
            }
            other => self.record(SkipReason::PaginationFailed {
                error: other.to_string(),
            }),
        }
    }

    fn record_cancelled(&self) {
        if !self.interruption_recorded.swap(true, Ordering::SeqCst) {
            self.record(SkipReason::Cancelled {
                processed: self.collected(),
            });
        }
    }

    fn record_ceiling(&self) {
        if let Some(limit) = self.max_nodes {
            if !self.ceiling_recorded.swap(true, Ordering::SeqCst) {
                self.record(SkipReason::CeilingReached { limit });
            }
        }
    }

    /// Skip reasons recorded so far, in order.
    pub fn skipped(&self) -> Vec<SkipReason> {
        self.skipped
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(max_nodes: Option<usize>) -> FetchContext {
        FetchContext::new(RequestBudget::new(5, 100, CancellationToken::new()), 4)
            .with_max_nodes(max_nodes)
    }

    #[test]
    fn admit_deduplicates_by_id() {
        let ctx = ctx(None);
        assert_eq!(ctx.admit("a"), Admission::Accepted);
        assert_eq!(ctx.admit("a"), Admission::Duplicate);
        assert_eq!(ctx.admit("b"), Admission::Accepted);
        assert_eq!(ctx.collected(), 2);
        assert!(ctx.skipped().is_empty());
    }

    #[test]
    fn ceiling_is_recorded_once() {
        let ctx = ctx(Some(2));
        assert_eq!(ctx.admit("a"), Admission::Accepted);
        assert_eq!(ctx.admit("b"), Admission::Accepted);
        assert_eq!(ctx.admit("c"), Admission::Full);
        assert_eq!(ctx.admit("d"), Admission::Full);
        assert!(ctx.should_stop());
        assert_eq!(ctx.skipped(), vec![SkipReason::CeilingReached { limit: 2 }]);
    }

    #[test]
    fn contexts_do_not_share_seen_sets() {
        let first = ctx(None);
        let second = ctx(None);
        assert_eq!(first.admit("a"), Admission::Accepted);
        assert_eq!(second.admit("a"), Admission::Accepted);
    }

    #[test]
    fn rate_limit_interruption_reports_processed_count() {
        let ctx = ctx(None);
        ctx.admit("a");
        ctx.admit("b");
        let err = ThreadError::RateLimited {
            retry_after: None,
            message: "429".into(),
        };
        ctx.record_interruption(&err);
        ctx.record_interruption(&err);
        assert_eq!(
            ctx.skipped(),
            vec![SkipReason::RateLimited {
                processed: 2,
                retry_after_secs: None
            }]
        );
    }

    #[test]
    fn cancellation_stops_collection() {
        let ctx = ctx(None);
        assert!(!ctx.should_stop());
        ctx.cancel_token().cancel();
        assert!(ctx.should_stop());
        assert!(matches!(ctx.skipped()[0], SkipReason::Cancelled { .. }));
    }
}

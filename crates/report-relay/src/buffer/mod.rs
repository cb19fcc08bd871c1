use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::report::Report;

/// The relay's single piece of shared state: reports decoded by the consumer,
/// waiting for the next drain.
///
/// Cloning hands out another reference to the same buffer. Uses
/// `std::sync::Mutex` (not tokio) because the lock is never held across
/// `.await`; append is a push and drain is a swap.
#[derive(Clone)]
pub struct ReportBuffer {
    reports: Arc<Mutex<VecDeque<Report>>>,
    max_reports: Option<usize>,
}

impl ReportBuffer {
    /// `max_reports: None` keeps every report until it is drained.
    pub fn new(max_reports: Option<usize>) -> Self {
        Self {
            reports: Arc::new(Mutex::new(VecDeque::new())),
            max_reports,
        }
    }

    // Neither critical section can be interrupted half-way, so a poisoned
    // lock still guards a consistent queue.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Report>> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a report at the end of the queue. If a cap is configured and
    /// reached, the oldest report is dropped to make room.
    pub fn append(&self, report: Report) {
        let full_at = {
            let mut reports = self.lock();
            reports.push_back(report);
            match self.max_reports {
                Some(max) if reports.len() > max => {
                    reports.pop_front();
                    Some(max)
                }
                _ => None,
            }
        };

        if let Some(max) = full_at {
            warn!(max_reports = max, "buffer full, evicted oldest report");
        }
    }

    /// Take every buffered report in arrival order, leaving the buffer empty.
    pub fn drain_all(&self) -> Vec<Report> {
        let taken = std::mem::take(&mut *self.lock());
        Vec::from(taken)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

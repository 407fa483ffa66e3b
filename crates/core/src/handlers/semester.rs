//! Which semesters currently have course data.
//!
//! Calendar rules give a newest candidate (term 1 runs August to January,
//! term 2 February to July). If neither the store nor an upstream probe has
//! courses for it yet, the window shifts back by one semester.

use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapters::CourseAdapter;
use crate::clock::{Clock, ROC_EPOCH};
use crate::context::RequestContext;
use crate::store::{CourseNamespace, Semester, Store};

/// Semesters kept in the detected window.
pub const WINDOW: usize = 4;

/// Newest-first semesters by calendar alone.
pub fn calendar_semesters(local: DateTime<FixedOffset>) -> Vec<Semester> {
    let roc = local.year() - ROC_EPOCH;
    let newest = match local.month() {
        8..=12 => Semester::new(roc, 1),
        1 => Semester::new(roc - 1, 1),
        _ => Semester::new(roc - 1, 2),
    };
    window_from(newest)
}

fn window_from(newest: Semester) -> Vec<Semester> {
    let mut out = Vec::with_capacity(WINDOW);
    let mut s = newest;
    for _ in 0..WINDOW {
        out.push(s);
        s = s.previous();
    }
    out
}

#[derive(Debug, Clone)]
struct Detected {
    /// Calendar candidate the window was computed for.
    candidate: Semester,
    window: Vec<Semester>,
}

/// Cached detector, refreshed by warm-up and on demand.
pub struct SemesterDetector {
    store: Arc<dyn Store>,
    adapter: CourseAdapter,
    clock: Arc<dyn Clock>,
    cached: RwLock<Option<Detected>>,
}

impl SemesterDetector {
    pub fn new(store: Arc<dyn Store>, adapter: CourseAdapter, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            adapter,
            clock,
            cached: RwLock::new(None),
        }
    }

    /// Most recent semesters with data, newest first.
    pub async fn semesters(&self, ctx: &RequestContext) -> Vec<Semester> {
        let candidate = calendar_semesters(self.clock.local_now())[0];
        if let Some(detected) = self.cached.read().await.as_ref() {
            if detected.candidate == candidate {
                return detected.window.clone();
            }
        }
        self.refresh(ctx).await
    }

    /// The newest `n` semesters of the window.
    pub async fn recent(&self, ctx: &RequestContext, n: usize) -> Vec<Semester> {
        let mut semesters = self.semesters(ctx).await;
        semesters.truncate(n);
        semesters
    }

    /// Recompute the window, probing upstream if the store has nothing.
    pub async fn refresh(&self, ctx: &RequestContext) -> Vec<Semester> {
        let calendar = calendar_semesters(self.clock.local_now());
        let candidate = calendar[0];
        let window = if self.has_data(ctx, candidate).await {
            calendar
        } else {
            info!(semester = %candidate, "Newest semester has no data yet; shifting back");
            window_from(candidate.previous())
        };

        *self.cached.write().await = Some(Detected {
            candidate,
            window: window.clone(),
        });
        window
    }

    async fn has_data(&self, ctx: &RequestContext, semester: Semester) -> bool {
        match self.store.course_count(CourseNamespace::Active, semester) {
            Ok(n) if n > 0 => return true,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Course count failed during semester detection"),
        }
        match self.adapter.probe(ctx, semester).await {
            Ok(found) => {
                debug!(semester = %semester, found, "Semester probe");
                found
            }
            // Keep the calendar answer when the probe cannot tell.
            Err(e) => {
                warn!(semester = %semester, error = %e, "Semester probe failed");
                true
            }
        }
    }
}

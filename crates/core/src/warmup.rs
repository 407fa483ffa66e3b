//! Bulk ingestion ahead of user traffic.
//!
//! Each module scrapes one entity class and writes it in batches. Modules
//! run concurrently under a single deadline and fail independently; the
//! report says what each one managed before it stopped.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{info, warn, Instrument};

use crate::adapters::{
    AdapterError, ContactAdapter, CourseAdapter, ProgramAdapter, StudentAdapter, DEGREE_PREFIXES,
};
use crate::context::{ContextError, RequestContext};
use crate::handlers::{HandlerDeps, SemesterDetector, SmartSearch, DEPARTMENTS};
use crate::store::{CourseNamespace, StoreError};

/// Concurrent upstream requests inside one module.
const MODULE_PARALLELISM: usize = 4;

/// Semesters of course listings ingested into the active namespace.
const COURSE_SEMESTERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarmupModule {
    Student,
    Contact,
    Course,
    Program,
    Semester,
}

impl WarmupModule {
    pub const ALL: [WarmupModule; 5] = [
        WarmupModule::Semester,
        WarmupModule::Student,
        WarmupModule::Contact,
        WarmupModule::Course,
        WarmupModule::Program,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WarmupModule::Student => "student",
            WarmupModule::Contact => "contact",
            WarmupModule::Course => "course",
            WarmupModule::Program => "program",
            WarmupModule::Semester => "semester",
        }
    }
}

impl fmt::Display for WarmupModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WarmupModule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown warm-up module '{}'", s))
    }
}

#[derive(Debug, Error)]
pub enum WarmupError {
    #[error(transparent)]
    Upstream(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Outcome of one module.
#[derive(Debug)]
pub struct ModuleReport {
    pub module: WarmupModule,
    /// Records written (for `semester`, semesters in the window).
    pub records: usize,
    pub error: Option<WarmupError>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct WarmupReport {
    pub modules: Vec<ModuleReport>,
}

impl WarmupReport {
    pub fn total_records(&self) -> usize {
        self.modules.iter().map(|m| m.records).sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ModuleReport> {
        self.modules.iter().filter(|m| m.error.is_some())
    }

    pub fn is_complete(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Collaborators of the warm-up run.
#[derive(Clone)]
pub struct WarmupDeps {
    pub handler: HandlerDeps,
    pub semesters: Arc<SemesterDetector>,
    /// Rebuilt after courses are ingested.
    pub smart: Option<Arc<SmartSearch>>,
}

/// Run `modules` concurrently until done or `deadline` passes.
pub async fn run(modules: &[WarmupModule], deps: &WarmupDeps, deadline: Duration) -> WarmupReport {
    let ctx = RequestContext::background().with_timeout(deadline);
    info!(
        modules = ?modules.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
        deadline_secs = deadline.as_secs(),
        "Warm-up started"
    );

    let runs = modules.iter().map(|&module| {
        let ctx = ctx.clone();
        async move {
            let started = Instant::now();
            let mut progress = 0;
            let result = ctx
                .guard(run_module(module, deps, &ctx, &mut progress))
                .await
                .map_err(WarmupError::from)
                .and_then(|r| r);
            let elapsed = started.elapsed();

            deps.handler
                .metrics
                .warmup_records
                .with_label_values(&[module.as_str()])
                .inc_by(progress as u64);
            match &result {
                Ok(()) => info!(module = %module, records = progress, ?elapsed, "Warm-up module done"),
                Err(e) => warn!(module = %module, records = progress, error = %e, "Warm-up module failed"),
            }
            ModuleReport {
                module,
                records: progress,
                error: result.err(),
                elapsed,
            }
        }
        .instrument(tracing::info_span!("warmup", module = module.as_str()))
    });

    let report = WarmupReport {
        modules: futures::future::join_all(runs).await,
    };
    info!(
        records = report.total_records(),
        failed = report.failed().count(),
        "Warm-up finished"
    );
    report
}

async fn run_module(
    module: WarmupModule,
    deps: &WarmupDeps,
    ctx: &RequestContext,
    progress: &mut usize,
) -> Result<(), WarmupError> {
    match module {
        WarmupModule::Semester => {
            *progress = deps.semesters.refresh(ctx).await.len();
            Ok(())
        }
        WarmupModule::Student => students(deps, ctx, progress).await,
        WarmupModule::Contact => contacts(deps, ctx, progress).await,
        WarmupModule::Course => courses(deps, ctx, progress).await,
        WarmupModule::Program => {
            let programs = ProgramAdapter::new(deps.handler.fetch.clone())
                .catalogue(ctx)
                .await?;
            *progress = deps.handler.store.save_programs(&programs)?;
            Ok(())
        }
    }
}

/// The newest cohort of every department.
async fn students(
    deps: &WarmupDeps,
    ctx: &RequestContext,
    progress: &mut usize,
) -> Result<(), WarmupError> {
    let Some(newest) = deps.semesters.recent(ctx, 1).await.first().copied() else {
        return Ok(());
    };
    let adapter = StudentAdapter::new(deps.handler.fetch.clone());
    let codes: Vec<&'static str> = DEPARTMENTS
        .iter()
        .flat_map(|(_, depts)| depts.iter().map(|(code, _)| *code))
        .collect();

    let jobs: Vec<_> = codes
        .into_iter()
        .map(|code| {
            let adapter = adapter.clone();
            async move { (code, adapter.by_year_department(ctx, newest.year, code).await) }
        })
        .collect();
    let mut pages = stream::iter(jobs).buffer_unordered(MODULE_PARALLELISM);

    while let Some((code, result)) = pages.next().await {
        match result {
            Ok(students) if !students.is_empty() => {
                *progress += deps.handler.store.save_students(&students)?;
            }
            Ok(_) => {}
            Err(AdapterError::Fetch(e)) if !e.is_retriable() => {
                warn!(department = code, error = %e, "Skipping department");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Organisation directory, then the members of every unit.
async fn contacts(
    deps: &WarmupDeps,
    ctx: &RequestContext,
    progress: &mut usize,
) -> Result<(), WarmupError> {
    let adapter = ContactAdapter::new(deps.handler.fetch.clone());
    let units = adapter.units(ctx).await?;
    *progress += deps.handler.store.save_contacts(&units)?;

    let mut pages = stream::iter(units.iter().map(|u| u.name.clone()).collect::<Vec<String>>())
        .map(|unit| {
            let adapter = adapter.clone();
            async move {
                let members = adapter.members(ctx, &unit).await;
                (unit, members)
            }
        })
        .buffer_unordered(MODULE_PARALLELISM);

    while let Some((unit, result)) = pages.next().await {
        match result {
            Ok(members) if !members.is_empty() => {
                *progress += deps.handler.store.save_contacts(&members)?;
            }
            Ok(_) => {}
            Err(e) => warn!(unit = %unit, error = %e, "Skipping unit members"),
        }
    }
    Ok(())
}

/// Full listings of the newest semesters, one page per degree prefix.
async fn courses(
    deps: &WarmupDeps,
    ctx: &RequestContext,
    progress: &mut usize,
) -> Result<(), WarmupError> {
    let adapter = CourseAdapter::new(deps.handler.fetch.clone());
    let semesters = deps.semesters.recent(ctx, COURSE_SEMESTERS).await;
    let jobs: Vec<_> = semesters
        .iter()
        .flat_map(|&s| DEGREE_PREFIXES.iter().map(move |&d| (s, d)))
        .collect();

    let mut pages = stream::iter(jobs)
        .map(|(semester, degree)| {
            let adapter = adapter.clone();
            async move { (semester, degree, adapter.listing(ctx, semester, degree).await) }
        })
        .buffer_unordered(MODULE_PARALLELISM);

    let mut last_error = None;
    let mut pages_ok = 0;
    while let Some((semester, degree, result)) = pages.next().await {
        match result {
            Ok(courses) => {
                pages_ok += 1;
                if !courses.is_empty() {
                    *progress += deps
                        .handler
                        .store
                        .save_courses(CourseNamespace::Active, &courses)?;
                }
            }
            Err(e) => {
                warn!(semester = %semester, degree = %degree, error = %e, "Course listing failed");
                last_error = Some(e);
            }
        }
    }
    drop(pages);

    if let Some(smart) = &deps.smart {
        smart.rebuild(deps.handler.store.as_ref()).await?;
    }
    match last_error {
        Some(e) if pages_ok == 0 => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchError;
    use crate::store::{Contact, Store};
    use crate::testing::fixtures;

    fn deps(env: &fixtures::TestEnv) -> WarmupDeps {
        WarmupDeps {
            handler: env.deps.clone(),
            semesters: Arc::new(SemesterDetector::new(
                env.store.clone(),
                CourseAdapter::new(env.fetch.clone()),
                env.clock.clone(),
            )),
            smart: None,
        }
    }

    #[test]
    fn test_module_names() {
        assert_eq!("Course".parse::<WarmupModule>(), Ok(WarmupModule::Course));
        assert_eq!(" semester ".parse::<WarmupModule>(), Ok(WarmupModule::Semester));
        assert!("weather".parse::<WarmupModule>().is_err());
    }

    #[tokio::test]
    async fn test_modules_fail_independently() {
        let env = fixtures::env();
        env.fetch.on(
            "program",
            "/programs",
            fixtures::program_page(&[("人工智慧學程", "/p/ai", "跨領域")]),
        );
        env.fetch.on(
            "sea",
            "/contact/units",
            fixtures::contact_page(&[Contact::organization("資訊中心", None)]),
        );
        env.fetch.on(
            "sea",
            "/contact/unit",
            fixtures::contact_page(&[Contact::person("王小明", Some("資訊中心".into()))]),
        );
        env.fetch.fail(
            "course",
            "/course/list",
            FetchError::UpstreamHttp { status: 500 },
        );

        let report = run(
            &[WarmupModule::Program, WarmupModule::Contact, WarmupModule::Course],
            &deps(&env),
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(report.modules.len(), 3);
        assert_eq!(report.modules[0].records, 1);
        assert!(report.modules[0].error.is_none());
        assert_eq!(report.modules[1].records, 2);
        assert!(report.modules[2].error.is_some());
        assert!(!report.is_complete());
        assert_eq!(env.store.all_programs().unwrap().len(), 1);
        assert_eq!(
            env.metrics
                .warmup_records
                .with_label_values(&["contact"])
                .get(),
            2
        );
    }

    #[tokio::test]
    async fn test_course_listings_land_in_active_namespace() {
        let env = fixtures::env();
        env.fetch.on(
            "course",
            "/course/list",
            fixtures::course_page(&[
                fixtures::course(113, 1, "U0001", "微積分", &["張三"]),
                fixtures::course(113, 1, "M0001", "機器學習", &["李四"]),
            ]),
        );

        let report = run(&[WarmupModule::Course], &deps(&env), Duration::from_secs(30)).await;
        assert!(report.is_complete());
        assert_eq!(
            env.store
                .course_count(CourseNamespace::Active, crate::store::Semester::new(113, 1))
                .unwrap(),
            2
        );
    }
}

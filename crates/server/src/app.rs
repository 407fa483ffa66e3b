//! Component wiring shared by the `server` and `warmup` commands.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use unibot_core::adapters::CourseAdapter;
use unibot_core::handlers::{
    intent_catalogue, ContactHandler, CourseHandler, ProgramHandler, SemesterDetector,
    SmartSearch, StudentHandler,
};
use unibot_core::processor::RandomStickers;
use unibot_core::store::TtlPolicy;
use unibot_core::warmup::{self, WarmupDeps, WarmupModule, WarmupReport};
use unibot_core::{
    create_parser, Clock, Config, Dispatcher, Fetch, HandlerDeps, KeyedLimiter,
    KeyedLimiterConfig, Metrics, Processor, ProcessorConfig, ScraperClient, SqliteStore, Store,
    SystemClock,
};

/// Everything the binary builds from the configuration.
pub struct Components {
    pub metrics: Arc<Metrics>,
    pub store: Arc<SqliteStore>,
    pub chat_limiter: Arc<KeyedLimiter>,
    pub llm_limiter: Arc<KeyedLimiter>,
    pub processor: Arc<Processor>,
    pub warmup: WarmupDeps,
}

impl Components {
    pub fn build(config: &Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new().context("Failed to create metrics registry")?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store = Arc::new(
            SqliteStore::new(
                &config.database.path,
                TtlPolicy::from_config(&config.cache),
                clock.clone(),
            )
            .with_context(|| format!("Failed to open store at {:?}", config.database.path))?,
        );
        info!("Store initialized");

        let fetch: Arc<dyn Fetch> = Arc::new(
            ScraperClient::new(&config.scraper, metrics.clone())
                .context("Failed to create scraper client")?,
        );

        let deps = HandlerDeps {
            store: store.clone(),
            fetch: fetch.clone(),
            clock: clock.clone(),
            metrics: metrics.clone(),
            envelope: config.envelope,
        };

        let chat_limiter = Arc::new(KeyedLimiter::new(
            "chat",
            KeyedLimiterConfig::chat(&config.limits),
        ));
        let llm_limiter = Arc::new(KeyedLimiter::new(
            "llm",
            KeyedLimiterConfig::llm(&config.limits),
        ));

        let parser = create_parser(config.nlu.as_ref(), intent_catalogue(), metrics.clone());
        info!(enabled = parser.is_enabled(), "Intent parser initialized");

        let smart = config.smart_search.enabled.then(|| {
            Arc::new(SmartSearch::new(
                &config.smart_search,
                parser.clone(),
                llm_limiter.clone(),
                metrics.clone(),
            ))
        });
        info!(enabled = smart.is_some(), "Smart search configured");
        let semesters = Arc::new(SemesterDetector::new(
            store.clone(),
            CourseAdapter::new(fetch),
            clock,
        ));

        let mut course = CourseHandler::new(deps.clone(), semesters.clone());
        if let Some(smart) = &smart {
            course = course.with_smart_search(smart.clone());
        }
        let dispatcher = Dispatcher::new(metrics.clone())
            .with(Arc::new(StudentHandler::new(deps.clone())))?
            .with(Arc::new(ContactHandler::new(deps.clone())))?
            .with(Arc::new(course))?
            .with(Arc::new(ProgramHandler::new(deps.clone())))?;

        let processor = Arc::new(Processor::new(
            ProcessorConfig::from_config(config),
            Arc::new(dispatcher),
            parser,
            chat_limiter.clone(),
            llm_limiter.clone(),
            Arc::new(RandomStickers::default()),
            metrics.clone(),
        ));

        Ok(Self {
            metrics,
            store,
            chat_limiter,
            llm_limiter,
            processor,
            warmup: WarmupDeps {
                handler: deps,
                semesters,
                smart,
            },
        })
    }
}

/// Parse module names; an empty list means every module.
pub fn parse_modules(names: &[String]) -> Result<Vec<WarmupModule>> {
    if names.is_empty() {
        return Ok(WarmupModule::ALL.to_vec());
    }
    names
        .iter()
        .map(|name| WarmupModule::from_str(name).map_err(|e| anyhow!(e)))
        .collect()
}

pub fn log_report(report: &WarmupReport) {
    for module in &report.modules {
        match &module.error {
            None => info!(
                module = %module.module,
                records = module.records,
                elapsed_ms = module.elapsed.as_millis() as u64,
                "Warm-up module finished"
            ),
            Some(e) => warn!(
                module = %module.module,
                records = module.records,
                error = %e,
                "Warm-up module failed"
            ),
        }
    }
    info!(
        total_records = report.total_records(),
        complete = report.is_complete(),
        "Warm-up finished"
    );
}

/// Run warm-up once in the background, then raise `done`.
pub fn spawn_startup_warmup(
    modules: Vec<WarmupModule>,
    deps: WarmupDeps,
    deadline: Duration,
    done: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Bring the search index up from whatever the store already holds.
        if let Some(smart) = &deps.smart {
            if let Err(e) = smart.rebuild(deps.handler.store.as_ref()).await {
                warn!(error = %e, "Failed to build search index from store");
            }
        }
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Startup warm-up interrupted by shutdown");
            }
            report = warmup::run(&modules, &deps, deadline) => {
                log_report(&report);
            }
        }
        done.store(true, Ordering::Release);
    })
}

/// Periodically evict expired store rows.
pub fn spawn_store_sweep(
    store: Arc<dyn Store>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Store sweep loop started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Store sweep loop received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let store = store.clone();
                    match tokio::task::spawn_blocking(move || store.sweep()).await {
                        Ok(Ok(stats)) => debug!(removed = stats.total(), "Store sweep finished"),
                        Ok(Err(e)) => warn!(error = %e, "Store sweep failed"),
                        Err(e) => warn!(error = %e, "Store sweep task failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modules() {
        assert_eq!(parse_modules(&[]).unwrap(), WarmupModule::ALL.to_vec());
        assert_eq!(
            parse_modules(&["Course".to_string(), " contact ".to_string()]).unwrap(),
            vec![WarmupModule::Course, WarmupModule::Contact]
        );
        assert!(parse_modules(&["weather".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_build_components_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.path = dir.path().join("unibot.db");

        let components = Components::build(&config).unwrap();
        components.store.ping().unwrap();
        assert!(components.warmup.smart.is_none());

        config.smart_search.enabled = true;
        let components = Components::build(&config).unwrap();
        assert!(components.warmup.smart.is_some());
    }

    #[tokio::test]
    async fn test_store_sweep_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.path = dir.path().join("unibot.db");
        let components = Components::build(&config).unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = spawn_store_sweep(
            components.store.clone(),
            Duration::from_secs(3600),
            shutdown_tx.subscribe(),
        );
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

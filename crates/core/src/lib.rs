pub mod adapters;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod fetcher;
pub mod handlers;
pub mod metrics;
pub mod nlu;
pub mod postback;
pub mod processor;
pub mod ratelimit;
pub mod reply;
pub mod store;
pub mod testing;
pub mod warmup;

pub use clock::{Clock, SystemClock};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, ConfigMode,
    SanitizedConfig,
};
pub use context::{CancelHandle, ContextError, RequestContext, TraceFields};
pub use dispatcher::{DispatchError, Dispatcher};
pub use fetcher::{Fetch, FetchError, FetchRequest, FetchResponse, ScraperClient};
pub use handlers::{Handler, HandlerDeps, HandlerError};
pub use metrics::Metrics;
pub use nlu::{create_parser, IntentParser, NluError, NluOutcome};
pub use processor::{Event, EventInput, EventSource, Processor, ProcessorConfig};
pub use ratelimit::{KeyedLimiter, KeyedLimiterConfig, UpstreamLimiter};
pub use reply::{Action, Bubble, Message};
pub use store::{SqliteStore, Store, StoreError};
pub use warmup::{WarmupDeps, WarmupModule, WarmupReport};

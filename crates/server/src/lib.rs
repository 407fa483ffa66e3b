pub mod api;
pub mod app;
pub mod line;
pub mod metrics;
pub mod state;

pub use api::create_router;
pub use app::Components;
pub use line::{LineReplyClient, Replier, ReplyError};
pub use metrics::HttpMetrics;
pub use state::AppState;

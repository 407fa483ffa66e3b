//! Event processing.
//!
//! The [`Processor`] turns one platform-neutral [`Event`] into the replies
//! for it:
//!
//! - per-chat admission
//! - input sanitisation and help shortcuts
//! - keyword dispatch, then NLU fallback for unclaimed text
//! - error classification into user-visible replies
//! - the reply envelope (message count, bubbles, text length)
//!
//! # Example
//!
//! ```ignore
//! use unibot_core::processor::{Event, EventInput, EventSource, Processor};
//!
//! let replies = processor
//!     .process(Event::new(EventSource::personal("U1"), EventInput::text("課程 微積分")))
//!     .await;
//! ```

mod config;
mod pipeline;
mod sanitize;
mod stickers;
mod types;

pub use config::{is_help_keyword, ProcessorConfig, HELP_KEYWORDS};
pub use pipeline::Processor;
pub use sanitize::{sanitize, sanitize_postback, strip_mentions};
pub use stickers::{RandomStickers, StickerSource, DEFAULT_STICKERS};
pub use types::{ChatKind, Event, EventInput, EventSource, Mention};

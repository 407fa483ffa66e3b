//! Sticker replies for personal chats.

use rand::seq::SliceRandom;

use crate::reply::Message;

/// Picks the sticker sent back when a user sends one.
pub trait StickerSource: Send + Sync {
    fn pick(&self) -> Option<Message>;
}

/// Freely usable platform stickers as `(package_id, sticker_id)`.
pub const DEFAULT_STICKERS: &[(&str, &str)] = &[
    ("11537", "52002734"),
    ("11537", "52002735"),
    ("11537", "52002738"),
    ("11537", "52002745"),
    ("11538", "51626494"),
    ("11538", "51626501"),
    ("11539", "52114110"),
    ("11539", "52114129"),
    ("446", "1988"),
    ("789", "10855"),
];

/// Uniform random choice from a fixed list.
#[derive(Debug, Clone)]
pub struct RandomStickers {
    stickers: Vec<(String, String)>,
}

impl RandomStickers {
    pub fn new(stickers: &[(&str, &str)]) -> Self {
        Self {
            stickers: stickers
                .iter()
                .map(|(p, s)| (p.to_string(), s.to_string()))
                .collect(),
        }
    }
}

impl Default for RandomStickers {
    fn default() -> Self {
        Self::new(DEFAULT_STICKERS)
    }
}

impl StickerSource for RandomStickers {
    fn pick(&self) -> Option<Message> {
        self.stickers
            .choose(&mut rand::thread_rng())
            .map(|(package, sticker)| Message::sticker(package.clone(), sticker.clone()))
    }
}

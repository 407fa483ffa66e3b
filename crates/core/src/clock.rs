//! Wall-clock abstraction.
//!
//! TTL freshness, ROC-year derivation and semester detection read the
//! clock through this trait so tests can pin "now".

use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc};

/// Offset of the institution's local time (UTC+8).
const LOCAL_OFFSET_SECS: i32 = 8 * 3600;

/// Gregorian year minus this is the ROC (Minguo) year.
pub const ROC_EPOCH: i32 = 1911;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time in the institution's local timezone.
    fn local_now(&self) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(LOCAL_OFFSET_SECS).unwrap_or(Utc.fix());
        self.now().with_timezone(&offset)
    }

    /// Current ROC year in local time.
    fn roc_year(&self) -> i32 {
        self.local_now().year() - ROC_EPOCH
    }
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convert a Gregorian year to ROC.
pub fn to_roc(gregorian: i32) -> i32 {
    gregorian - ROC_EPOCH
}

/// Convert a ROC year to Gregorian.
pub fn to_gregorian(roc: i32) -> i32 {
    roc + ROC_EPOCH
}

/// Interpret a user-entered year: values above 1911 are Gregorian.
pub fn normalize_year(year: i32) -> i32 {
    if year > ROC_EPOCH {
        to_roc(year)
    } else {
        year
    }
}

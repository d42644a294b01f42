//! Duration estimation for a day's activities.
//!
//! Pure functions. An activity is timed by exactly one scheme: a hold (sets of static holds),
//! a single timed block, or repetitions. Stored entries are loose and may carry fields from
//! more than one scheme, so [`ActivityEntry::scheme`] resolves them with a fixed precedence:
//! hold, then timed (only without sets), then repetitions, else a flat default.

use serde::{Deserialize, Serialize};

/// Seconds credited per repetition.
pub const SECONDS_PER_REPETITION: u64 = 5;

/// Seconds credited to an entry that carries no usable scheme.
pub const DEFAULT_ACTIVITY_SECONDS: u64 = 60;

/// One activity inside a generated day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    /// Opaque key into the content catalog.
    pub ref_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sets: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetitions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_seconds: Option<u32>,
    /// Rest between sets; negative values count as zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_warmup: bool,
}

/// Resolved timing scheme of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum ActivityScheme {
    Hold {
        sets: u32,
        hold_seconds: u32,
        rest_seconds: u32,
    },
    Timed {
        seconds: u32,
    },
    Reps {
        sets: u32,
        repetitions: u32,
        rest_seconds: u32,
    },
    Unspecified,
}

impl ActivityScheme {
    pub fn seconds(&self) -> u64 {
        match *self {
            ActivityScheme::Hold {
                sets,
                hold_seconds,
                rest_seconds,
            } => u64::from(sets) * u64::from(hold_seconds) + rest_total(sets, rest_seconds),
            ActivityScheme::Timed { seconds } => u64::from(seconds),
            ActivityScheme::Reps {
                sets,
                repetitions,
                rest_seconds,
            } => {
                u64::from(sets) * u64::from(repetitions) * SECONDS_PER_REPETITION
                    + rest_total(sets, rest_seconds)
            }
            ActivityScheme::Unspecified => DEFAULT_ACTIVITY_SECONDS,
        }
    }
}

fn rest_total(sets: u32, rest_seconds: u32) -> u64 {
    u64::from(sets.saturating_sub(1)) * u64::from(rest_seconds)
}

impl ActivityEntry {
    /// Map the loose stored shape onto exactly one scheme.
    ///
    /// An entry carrying both a hold and repetitions is a hold. `timed_seconds` only applies
    /// when `sets` is absent.
    pub fn scheme(&self) -> ActivityScheme {
        let rest_seconds = self.rest_seconds.unwrap_or(0).clamp(0, i64::from(u32::MAX)) as u32;
        match (self.sets, self.hold_seconds, self.timed_seconds, self.repetitions) {
            (Some(sets), Some(hold_seconds), _, _) => ActivityScheme::Hold {
                sets,
                hold_seconds,
                rest_seconds,
            },
            (None, _, Some(seconds), _) => ActivityScheme::Timed { seconds },
            (Some(sets), _, _, Some(repetitions)) => ActivityScheme::Reps {
                sets,
                repetitions,
                rest_seconds,
            },
            _ => ActivityScheme::Unspecified,
        }
    }

    /// True when the entry carries fields of more than one scheme.
    pub fn is_ambiguous(&self) -> bool {
        let schemes = [
            self.hold_seconds.is_some(),
            self.timed_seconds.is_some(),
            self.repetitions.is_some(),
        ];
        schemes.iter().filter(|present| **present).count() > 1
    }
}

/// Estimated seconds for one activity.
pub fn compute_seconds(entry: &ActivityEntry) -> u64 {
    entry.scheme().seconds()
}

/// Estimated whole minutes for a day, rounded up. Empty input is zero.
pub fn aggregate_minutes<'a, I>(entries: I) -> u32
where
    I: IntoIterator<Item = &'a ActivityEntry>,
{
    let total: u64 = entries.into_iter().map(compute_seconds).sum();
    let minutes = total.div_ceil(60);
    u32::try_from(minutes).unwrap_or(u32::MAX)
}

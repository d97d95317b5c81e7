//! Capabilities a cycle takes from its environment: the current time, and a random choice.
//! Both are traits so a run can be replayed with fixed values.

use chrono::{DateTime, Utc};
use rand::Rng;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whole seconds from `start` to `end`, never negative
pub fn whole_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().max(0)
}

pub trait Chooser {
    /// Pick an index in `0..len`. Only called with `len > 0`.
    fn pick(&self, len: usize) -> usize;
}

pub struct RandomChooser;

impl Chooser for RandomChooser {
    fn pick(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

pub fn choose<'a>(chooser: &dyn Chooser, pool: &'a [String]) -> Option<&'a str> {
    if pool.is_empty() {
        return None;
    }
    pool.get(chooser.pick(pool.len())).map(String::as_str)
}

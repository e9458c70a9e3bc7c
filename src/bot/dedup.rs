use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Request ids that already produced a network call.
///
/// Shared by reference with every request. The first caller for an id
/// claims it; later callers are refused with the age of that claim until it
/// ages out.
#[derive(Debug)]
pub struct ProcessedIds {
    retention: Duration,
    ids: Mutex<HashMap<String, Instant>>,
}

impl ProcessedIds {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            ids: Mutex::new(HashMap::new()),
        }
    }

    /// Claim `id` for one network call.
    ///
    /// `Err(age)` means the id was already claimed `age` ago and is still
    /// within retention. Expired entries are evicted only when a new claim
    /// is recorded.
    pub fn claim(&self, id: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut ids = self.ids.lock();

        if let Some(claimed_at) = ids.get(id) {
            let age = now.duration_since(*claimed_at);
            if age < self.retention {
                return Err(age);
            }
        }

        let retention = self.retention;
        ids.retain(|_, claimed_at| now.duration_since(*claimed_at) < retention);
        ids.insert(id.to_owned(), now);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        let now = Instant::now();
        self.ids
            .lock()
            .get(id)
            .is_some_and(|seen_at| now.duration_since(*seen_at) < self.retention)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

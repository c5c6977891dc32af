use std::collections::BTreeMap;
use std::sync::Mutex;

/// Metrics sink. Keys are dotted names such as `pack.shards_recovered`.
pub trait Telemetry: Send + Sync {
    fn increment(&self, key: &str, by: u64);

    fn observe(&self, key: &str, value: f64);

    fn set_gauge(&self, key: &str, value: f64);

    fn event(&self, name: &str, tags: &[(&str, String)], metrics: &[(&str, f64)]);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn increment(&self, _key: &str, _by: u64) {}

    fn observe(&self, _key: &str, _value: f64) {}

    fn set_gauge(&self, _key: &str, _value: f64) {}

    fn event(&self, _name: &str, _tags: &[(&str, String)], _metrics: &[(&str, f64)]) {}
}

#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Observation {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    observations: BTreeMap<String, Observation>,
    events: BTreeMap<String, u64>,
}

/// In-process sink that keeps everything it is given.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    store: Mutex<Store>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_store<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        let mut guard = match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.with_store(|s| s.counters.get(key).copied().unwrap_or(0))
    }

    pub fn gauge(&self, key: &str) -> Option<f64> {
        self.with_store(|s| s.gauges.get(key).copied())
    }

    pub fn observation(&self, key: &str) -> Option<Observation> {
        self.with_store(|s| s.observations.get(key).cloned())
    }

    pub fn event_count(&self, name: &str) -> u64 {
        self.with_store(|s| s.events.get(name).copied().unwrap_or(0))
    }

    pub fn counters(&self) -> Vec<(String, u64)> {
        self.with_store(|s| s.counters.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    pub fn gauges(&self) -> Vec<(String, f64)> {
        self.with_store(|s| s.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    pub fn reset(&self) {
        self.with_store(|s| *s = Store::default());
    }
}

impl Telemetry for MemoryTelemetry {
    fn increment(&self, key: &str, by: u64) {
        self.with_store(|s| *s.counters.entry(key.to_owned()).or_default() += by);
    }

    fn observe(&self, key: &str, value: f64) {
        self.with_store(|s| s.observations.entry(key.to_owned()).or_default().record(value));
    }

    fn set_gauge(&self, key: &str, value: f64) {
        self.with_store(|s| {
            s.gauges.insert(key.to_owned(), value);
        });
    }

    fn event(&self, name: &str, tags: &[(&str, String)], metrics: &[(&str, f64)]) {
        log::trace!("event {name} tags={tags:?} metrics={metrics:?}");
        self.with_store(|s| *s.events.entry(name.to_owned()).or_default() += 1);
    }
}

//! Cooperative driver that ticks registered services once per cycle
//! (spec §4.9).
//!
//! The tracking service's sweep and the resolution service's housekeeping
//! are both [`Delegate`]s, registered at construction by whatever owns
//! them. The scheduler itself does not know what a tick *means* to a given
//! delegate — it only orders delegates by priority and dependency and
//! drives them round-robin.

use std::collections::HashMap;
use std::sync::Arc;

/// Something the scheduler can invoke once per cycle.
pub trait Delegate: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    fn execute(&self);
}

struct Entry {
    delegate: Arc<dyn Delegate>,
    depends_on: Vec<String>,
}

/// Holds the set of named delegates and exposes them in a topological,
/// priority-stable order.
#[derive(Default)]
pub struct Registrar {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `delegate`, optionally declaring dependencies by name.
    /// Dependencies must already be registered.
    pub fn register(&mut self, delegate: Arc<dyn Delegate>, depends_on: &[&str]) {
        let name = delegate.name().to_string();
        self.entries.insert(
            name.clone(),
            Entry {
                delegate,
                depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            },
        );
        self.order = self.topological_order();
    }

    fn topological_order(&self) -> Vec<String> {
        let mut resolved: Vec<String> = Vec::with_capacity(self.entries.len());
        let mut visiting = std::collections::HashSet::new();

        fn visit(
            name: &str,
            entries: &HashMap<String, Entry>,
            resolved: &mut Vec<String>,
            visiting: &mut std::collections::HashSet<String>,
        ) {
            if resolved.iter().any(|r| r == name) || visiting.contains(name) {
                return;
            }
            visiting.insert(name.to_string());
            if let Some(entry) = entries.get(name) {
                for dependency in &entry.depends_on {
                    visit(dependency, entries, resolved, visiting);
                }
            }
            resolved.push(name.to_string());
        }

        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort_by_key(|name| std::cmp::Reverse(self.entries[*name].delegate.priority()));
        for name in names {
            visit(name, &self.entries, &mut resolved, &mut visiting);
        }
        resolved
    }

    pub fn delegates(&self) -> Vec<Arc<dyn Delegate>> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|entry| entry.delegate.clone())
            .collect()
    }
}

/// Repeatedly cycles through a [`Registrar`]'s delegates, invoking each
/// one's `execute` once per tick on a fixed interval. Ticking is the unit
/// of progress; there is no preemption — a slow delegate delays the rest
/// of the cycle.
pub struct TaskService {
    registrar: Arc<parking_lot::RwLock<Registrar>>,
    interval: std::time::Duration,
}

impl TaskService {
    pub fn new(registrar: Arc<parking_lot::RwLock<Registrar>>, interval: std::time::Duration) -> Self {
        Self { registrar, interval }
    }

    /// Runs one cycle over the current delegate order.
    pub fn tick(&self) {
        for delegate in self.registrar.read().delegates() {
            delegate.execute();
        }
    }

    /// Spawns a task that ticks forever on `interval`. Returns the handle
    /// so the caller can abort it on shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.tick();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(&'static str, Arc<AtomicUsize>, i32);

    impl Delegate for Counter {
        fn name(&self) -> &str {
            self.0
        }

        fn priority(&self) -> i32 {
            self.2
        }

        fn execute(&self) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tick_invokes_every_delegate() {
        let mut registrar = Registrar::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        registrar.register(Arc::new(Counter("a", a.clone(), 0)), &[]);
        registrar.register(Arc::new(Counter("b", b.clone(), 0)), &[]);

        let registrar = Arc::new(parking_lot::RwLock::new(registrar));
        let service = TaskService::new(registrar, std::time::Duration::from_millis(10));
        service.tick();
        service.tick();

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dependencies_precede_dependents() {
        let mut registrar = Registrar::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        struct Recording(&'static str, Arc<parking_lot::Mutex<Vec<&'static str>>>);
        impl Delegate for Recording {
            fn name(&self) -> &str {
                self.0
            }
            fn execute(&self) {
                self.1.lock().push(self.0);
            }
        }

        registrar.register(Arc::new(Recording("leaf", order.clone())), &[]);
        registrar.register(Arc::new(Recording("root", order.clone())), &["leaf"]);

        for delegate in registrar.delegates() {
            delegate.execute();
        }

        assert_eq!(*order.lock(), vec!["leaf", "root"]);
    }
}

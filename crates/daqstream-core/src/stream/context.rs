//! Per-device session that owns task ids and the clock registry

use crate::driver::DriverAdapter;
use crate::stream::channels::Direction;
use crate::stream::clock::{ClockRegistry, TaskId};
use crate::stream::pulse::PulseTask;
use crate::stream::task::StreamTask;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Factory for stream tasks sharing one driver adapter
///
/// Tasks created from the same context can borrow each other's sample
/// clocks; the context's registry is where those bindings are checked.
pub struct StreamContext {
    driver: Arc<dyn DriverAdapter>,
    registry: ClockRegistry,
    next_id: AtomicU64,
}

impl StreamContext {
    pub fn new(driver: Arc<dyn DriverAdapter>) -> Self {
        Self {
            driver,
            registry: ClockRegistry::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a task in the `Created` state
    pub fn create_task(&self, name: &str, direction: Direction) -> StreamTask {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(task = name, %id, ?direction, "Task created");
        StreamTask::new(
            id,
            name,
            direction,
            Arc::clone(&self.driver),
            self.registry.clone(),
        )
    }

    /// Create a counter pulse task in the `Created` state
    pub fn create_pulse_task(&self, name: &str) -> PulseTask {
        tracing::debug!(task = name, "Pulse task created");
        PulseTask::new(name, Arc::clone(&self.driver))
    }

    /// Clock bindings of this context's tasks
    pub fn registry(&self) -> &ClockRegistry {
        &self.registry
    }

    /// The adapter shared by this context's tasks
    pub fn driver(&self) -> Arc<dyn DriverAdapter> {
        Arc::clone(&self.driver)
    }
}

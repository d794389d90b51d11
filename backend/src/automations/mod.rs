// Automation engine - trigger matching, action sequencing, registry and analytics

pub mod analytics;
pub mod clock;
pub mod engine;
pub mod locks;
pub mod registry;
pub mod schedule;
pub mod sequencer;
pub mod template;
pub mod triggers;

pub use analytics::AnalyticsAggregator;
pub use clock::{Clock, SystemClock};
pub use engine::{AutomationEngine, Collaborators, DispatchedRun, Stores};
pub use locks::ContactLocks;
pub use registry::AutomationRegistry;
pub use schedule::{RecurrenceOracle, ScheduleOracle};
pub use sequencer::{ActionSequencer, RunOutcome};
pub use triggers::{EventKind, TriggerEvent, TriggerMatcher};

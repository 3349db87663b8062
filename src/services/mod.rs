pub mod extract;
pub mod fetch_guard;
pub mod notifier;
pub mod policy;
pub mod poller;
pub mod stats;
pub mod store;

pub use extract::{FieldSpec, KeySpec, RecordExtractor};
pub use fetch_guard::{FetchGuard, FetchOutcome};
pub use notifier::{AlertFormatter, LogSink, MessageTemplate, Notifier, NotifySink, TelegramSink};
pub use policy::{Decision, NamedPredicate, Predicate, ThresholdPolicy, NEW_ENTITY};
pub use poller::{cancel_pair, run_once, CancelHandle, CancelSignal, PollScheduler, Poller, Schedule};
pub use stats::{CycleReport, PollStats, WatcherStats};
pub use store::{Apply, DedupeStore, FileStore, MemoryStore};

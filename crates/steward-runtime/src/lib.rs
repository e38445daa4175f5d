//! `steward-runtime` – the running kernel.
//!
//! Wires the components of `steward-kernel` and `steward-governance` into a
//! live system on the Tokio runtime.
//!
//! # Modules
//!
//! - [`kernel`] – [`Kernel`]: owns the event bus and every component, drives
//!   the scheduler clock, resource sampling and heartbeat sweeps on
//!   [`IntervalTimer`]s, and feeds task outcomes to recovery.
//! - [`engine`] – [`ExecutionEngine`]: dispatch queue, concurrency limit,
//!   retries with backoff and cancellation.
//! - [`isolation`] – [`IsolationContext`]: one execution raced against its
//!   time limit, budget poll and [`KillSwitch`].
//! - [`gate`] – [`AdmissionGate`]: permission checks and budget lookup
//!   before a body runs.
//! - [`metrics`] – [`MetricsCollector`]: counters, gauges and histograms
//!   fed by every bus event, exportable as Prometheus text.
//! - [`timer`] – [`IntervalTimer`]: named periodic jobs with a stop signal.
//! - [`config`] – [`KernelConfig`]: every tunable, serde-friendly.
//! - [`telemetry`] – [`init_tracing`]: subscriber and optional OTLP export.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use steward_runtime::{Kernel, KernelConfig, executor};
//! use steward_types::{EntityKind, TaskOptions};
//!
//! # async fn run() -> Result<(), steward_types::KernelError> {
//! let kernel = Kernel::new(KernelConfig::default())?;
//! kernel.start()?;
//!
//! let task = kernel.create_task(
//!     "summarise", "text", "agent-1", EntityKind::Agent,
//!     serde_json::json!({ "doc": 7 }), TaskOptions::default().priority(8),
//! );
//! let id = kernel.submit(task, executor(|ctx| async move {
//!     ctx.report_progress(0.5, None);
//!     Ok(ctx.payload().clone())
//! }), None)?;
//!
//! kernel.wait_for(&id, Duration::from_secs(5)).await;
//! kernel.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod gate;
pub mod isolation;
pub mod kernel;
pub mod metrics;
pub mod telemetry;
pub mod timer;

pub use config::{KernelConfig, TimerConfig};
pub use engine::{ConcurrencyLimit, EngineConfig, EngineStats, ExecutionEngine};
pub use gate::AdmissionGate;
pub use isolation::{
    ExecutionOutcome, Executor, IsolationContext, KillSwitch, TaskContext, TaskFuture, executor,
};
pub use kernel::{Kernel, RESTORE_CONCURRENCY, failure_class};
pub use metrics::{HistogramSummary, MetricsCollector, MetricsSnapshot};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use timer::IntervalTimer;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A component as the runtime shares it.
pub type Shared<T> = Arc<Mutex<T>>;

/// Lock, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

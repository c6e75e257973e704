//! Plan execution: the engine, its dependency scheduler, and the results,
//! traces, metrics and observer hooks a run produces.

pub mod config;
pub mod context;
pub mod engine;
pub mod metrics;
pub mod observer;
pub mod result;
pub mod scheduler;
pub mod trace;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use context::{ContextOverrides, ExecutionContext};
pub use engine::ExecutionEngine;
pub use metrics::{EngineMetrics, EngineMetricsSnapshot, MetricsCollector, NoopMetricsCollector};
pub use observer::{
    CompositeObserver, ExecutionObserver, LoggingObserver, ObserverEvent, RecordingObserver,
};
pub use result::{
    ExecutionError, ExecutionMetrics, ExecutionResult, ExecutionStatus, StepError, StepResult,
    StepStatus,
};
pub use scheduler::DependencyScheduler;
pub use trace::{DecisionRecord, ExecutionTrace, LlmCallRecord, Phase, PhaseRecord, TraceRecorder};

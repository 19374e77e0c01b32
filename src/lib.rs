//! Frame-presentation telemetry core.
//!
//! `framemon` ingests raw per-present events gathered from the OS graphics
//! stack, sequences them per swap chain, and derives a stable stream of
//! per-frame latency and throughput metrics. The stream is served three
//! ways: per-frame blob queries, time-windowed statistic queries, and CSV
//! recording.
//!
//! The crate deliberately stops at the trace boundary: producing the raw
//! events, vendor telemetry adapters, and the shared-memory transport are
//! external concerns that feed the rings defined here.

pub mod control;
pub mod csv;
pub mod error;
pub mod intro;
pub mod metrics;
pub mod present;
pub mod query;
pub mod ring;
pub mod service;
pub mod source;
pub mod telemetry;
pub mod timebase;

pub use error::{Result, ServiceError};
pub use intro::{Introspection, MetricId, StatId, SYSTEM_DEVICE_ID, UNIVERSAL_DEVICE_ID};
pub use metrics::{FrameMetrics, MetricsVersion};
pub use present::{FrameData, FrameType, PresentResult};
pub use query::{DynamicQuery, FrameEventQuery, QueryElement};
pub use ring::HistoryRing;
pub use service::{Service, ServiceConfig, TraceEvent};
pub use source::FrameMetricsSource;
pub use timebase::TimeBase;

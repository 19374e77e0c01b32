mod animation;
mod base;
pub mod calculator;
pub mod chain_state;
mod cpu_gpu;
pub mod display;
mod input;
mod instrumented;
pub mod sequencer;
pub mod types;

pub use calculator::{compute_frame_metrics, compute_metrics_for_present};
pub use chain_state::{AnimationErrorSource, SwapChainCoreState};
pub use sequencer::UnifiedSwapChain;
pub use types::{ComputedMetrics, FrameMetrics, MetricsVersion, StateDeltas};

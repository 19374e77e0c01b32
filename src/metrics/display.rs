use crate::metrics::calculator::calculate_cpu_start;
use crate::metrics::chain_state::SwapChainCoreState;
use crate::metrics::types::{FrameMetrics, MetricsVersion};
use crate::present::FrameData;
use crate::timebase::TimeBase;

/// The display-index range processed for a present, and which index carries
/// the app-frame metrics.
///
/// A present with `N` displayed entries is processed in two stages: indices
/// `[0, N-1)` while the present is the newest displayed one (the final
/// instance has no successor screen time yet), and `[N-1, N)` once the next
/// displayed present arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayIndexing {
    pub start_index: usize,
    pub end_index: usize,
    pub app_index: Option<usize>,
    pub has_next_displayed: bool,
}

impl DisplayIndexing {
    pub fn calculate(present: &FrameData, has_next_displayed: bool) -> Self {
        let display_count = present.displayed_count();
        let displayed = present.is_displayed();

        let (start_index, end_index) = if !displayed || display_count == 0 {
            (0, 0)
        } else if !has_next_displayed {
            // Postpone the final instance until its successor shows up.
            (0, display_count - 1)
        } else {
            (display_count - 1, display_count)
        };

        // The app index is searched from the processing start through *all*
        // displayed entries, not just the processed range.
        let app_index = if display_count > 0 {
            (start_index..display_count).find(|&i| present.displayed[i].0.is_app())
        } else {
            Some(0)
        };

        DisplayIndexing {
            start_index,
            end_index,
            app_index,
            has_next_displayed,
        }
    }

    pub fn is_app_index(&self, display_index: usize) -> bool {
        self.app_index == Some(display_index)
    }
}

/// Collapsed/runt frame correction for presents carrying a flip delay.
///
/// V2: when this present's adjusted screen time lands after its successor's,
/// the successor inherits the difference as extra flip delay and its first
/// screen time is pinned so the two instances do not overlap. V1 applies the
/// symmetric rule against the previous displayed present instead.
pub fn adjust_screen_time_for_collapsed_present(
    present: &mut FrameData,
    next_displayed: Option<&mut FrameData>,
    last_displayed_flip_delay: u64,
    last_displayed_screen_time: u64,
    screen_time: &mut u64,
    next_screen_time: &mut u64,
    version: MetricsVersion,
) {
    if version == MetricsVersion::V1 {
        if last_displayed_flip_delay > 0
            && last_displayed_screen_time > *screen_time
            && !present.displayed.is_empty()
        {
            let diff = last_displayed_screen_time - *screen_time;
            present.flip_delay += diff;
            present.displayed[0].1 = last_displayed_screen_time;
            *screen_time = present.displayed[0].1;
        }
        return;
    }

    if present.flip_delay != 0 && *screen_time > *next_screen_time {
        if let Some(next) = next_displayed {
            if !next.displayed.is_empty() {
                next.flip_delay += *screen_time - *next_screen_time;
                *next_screen_time = *screen_time;
                next.displayed[0].1 = *next_screen_time;
            }
        }
    }
}

pub fn calculate_display_metrics(
    tb: &TimeBase,
    present: &FrameData,
    chain: &SwapChainCoreState,
    is_displayed: bool,
    screen_time: u64,
    next_screen_time: u64,
    out: &mut FrameMetrics,
) {
    out.ms_until_displayed = if is_displayed {
        tb.delta_unsigned_ms(present.present_start_time, screen_time)
    } else {
        0.0
    };

    out.ms_between_display_change = if is_displayed {
        tb.delta_unsigned_ms(chain.last_displayed_screen_time, screen_time)
    } else {
        0.0
    };

    out.ms_displayed_time = if is_displayed {
        tb.delta_unsigned_ms(screen_time, next_screen_time)
    } else {
        0.0
    };

    out.ms_flip_delay = if is_displayed && present.flip_delay != 0 {
        Some(tb.ticks_to_ms(present.flip_delay))
    } else {
        None
    };

    let cpu_start = calculate_cpu_start(chain, present);
    out.ms_display_latency = if is_displayed && cpu_start != 0 {
        tb.delta_unsigned_ms(cpu_start, screen_time)
    } else {
        0.0
    };

    out.ms_ready_time_to_display_latency = if is_displayed && present.ready_time != 0 {
        Some(tb.delta_unsigned_ms(present.ready_time, screen_time))
    } else {
        None
    };

    out.is_dropped_frame = !is_displayed;
    out.screen_time_qpc = screen_time;
}

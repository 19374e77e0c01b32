use crate::metrics::calculator::calculate_animation_sim_start;
use crate::metrics::chain_state::{AnimationErrorSource, SwapChainCoreState};
use crate::metrics::types::FrameMetrics;
use crate::present::FrameData;
use crate::timebase::TimeBase;

/// Signed difference between elapsed simulation time and elapsed display
/// time across two consecutive displayed app frames.
fn animation_error(
    tb: &TimeBase,
    chain: &SwapChainCoreState,
    present: &FrameData,
    is_displayed: bool,
    is_app_frame: bool,
    screen_time: u64,
) -> Option<f64> {
    if !is_displayed || !is_app_frame {
        return None;
    }

    let current_sim_start =
        calculate_animation_sim_start(chain, present, chain.animation_error_source);

    if current_sim_start == 0
        || chain.last_displayed_sim_start_time == 0
        || current_sim_start <= chain.last_displayed_sim_start_time
        || chain.last_displayed_app_screen_time == 0
    {
        return None;
    }

    let sim_elapsed = tb.delta_unsigned_ms(chain.last_displayed_sim_start_time, current_sim_start);
    let display_elapsed = tb.delta_unsigned_ms(chain.last_displayed_app_screen_time, screen_time);

    if sim_elapsed == 0.0 || display_elapsed == 0.0 {
        return None;
    }

    Some(sim_elapsed - display_elapsed)
}

fn animation_time(
    tb: &TimeBase,
    chain: &SwapChainCoreState,
    present: &FrameData,
    is_displayed: bool,
    is_app_frame: bool,
) -> Option<f64> {
    if !is_displayed || !is_app_frame {
        return None;
    }

    // Seed frame: a provider sim-start arrived while the source still reads
    // CpuStart. The source flips during the state advance, so no animation
    // time is reported yet.
    let is_first_provider_sim_time = chain.animation_error_source == AnimationErrorSource::CpuStart
        && (present.app_sim_start_time != 0 || present.pcl_sim_start_time != 0);
    if is_first_provider_sim_time {
        return None;
    }

    let current_sim_start =
        calculate_animation_sim_start(chain, present, chain.animation_error_source);
    if current_sim_start == 0 {
        return None;
    }

    let first_sim_start = if chain.first_app_sim_start_time != 0 {
        chain.first_app_sim_start_time
    } else {
        tb.session_start()
    };
    if current_sim_start > first_sim_start {
        Some(tb.delta_unsigned_ms(first_sim_start, current_sim_start))
    } else {
        Some(0.0)
    }
}

pub fn calculate_animation_metrics(
    tb: &TimeBase,
    chain: &SwapChainCoreState,
    present: &FrameData,
    is_displayed: bool,
    is_app_frame: bool,
    screen_time: u64,
    out: &mut FrameMetrics,
) {
    out.ms_animation_error =
        animation_error(tb, chain, present, is_displayed, is_app_frame, screen_time);
    out.ms_animation_time = animation_time(tb, chain, present, is_displayed, is_app_frame);
}

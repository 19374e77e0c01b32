use crate::metrics::chain_state::SwapChainCoreState;
use crate::metrics::types::{FrameMetrics, StateDeltas};
use crate::present::FrameData;
use crate::timebase::TimeBase;

/// One input-to-photon track. All three tracks share the same two-case
/// shape: an input carried by this present is either credited immediately
/// (displayed) or stashed for the next displayed frame; a displayed present
/// without its own input consumes a previously stashed one.
fn input_to_photon(
    tb: &TimeBase,
    present_input_time: u64,
    stashed_input_time: u64,
    is_displayed: bool,
    is_app_frame: bool,
    screen_time: u64,
    stash: impl FnOnce(&mut StateDeltas, u64),
    deltas: &mut StateDeltas,
) -> Option<f64> {
    if !is_app_frame {
        return None;
    }

    let mut input_time = 0;

    if present_input_time != 0 {
        input_time = present_input_time;
        if !is_displayed {
            stash(deltas, input_time);
            return None;
        }
        deltas.should_reset_input_times = true;
    } else if is_displayed && stashed_input_time != 0 {
        input_time = stashed_input_time;
        deltas.should_reset_input_times = true;
    }

    if input_time == 0 {
        return None;
    }

    Some(tb.delta_unsigned_ms(input_time, screen_time))
}

pub fn calculate_input_latency_metrics(
    tb: &TimeBase,
    chain: &SwapChainCoreState,
    present: &FrameData,
    is_displayed: bool,
    is_app_frame: bool,
    out: &mut FrameMetrics,
    deltas: &mut StateDeltas,
) {
    let screen_time = out.screen_time_qpc;

    out.ms_click_to_photon_latency = input_to_photon(
        tb,
        present.mouse_click_time,
        chain.last_received_not_displayed_mouse_click_time,
        is_displayed,
        is_app_frame,
        screen_time,
        |d, t| d.last_received_not_displayed_mouse_click_time = Some(t),
        deltas,
    );

    out.ms_all_input_photon_latency = input_to_photon(
        tb,
        present.input_time,
        chain.last_received_not_displayed_all_input_time,
        is_displayed,
        is_app_frame,
        screen_time,
        |d, t| d.last_received_not_displayed_all_input_time = Some(t),
        deltas,
    );

    out.ms_instrumented_input_time = input_to_photon(
        tb,
        present.app_input_sample.time,
        chain.last_received_not_displayed_app_provider_input_time,
        is_displayed,
        is_app_frame,
        screen_time,
        |d, t| d.last_received_not_displayed_app_provider_input_time = Some(t),
        deltas,
    );
}

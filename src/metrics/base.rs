use crate::metrics::chain_state::SwapChainCoreState;
use crate::metrics::types::FrameMetrics;
use crate::present::FrameData;
use crate::timebase::TimeBase;

fn present_start_ms(tb: &TimeBase, present: &FrameData) -> f64 {
    let session_start = tb.session_start();
    if session_start != 0 && present.present_start_time != 0 {
        tb.delta_signed_ms(session_start, present.present_start_time)
    } else {
        0.0
    }
}

/// Metrics derivable from the present call alone, plus passthrough metadata.
pub fn calculate_base_present_metrics(
    tb: &TimeBase,
    present: &FrameData,
    chain: &SwapChainCoreState,
    out: &mut FrameMetrics,
) {
    out.present_start_qpc = present.present_start_time;
    out.present_start_ms = present_start_ms(tb, present);
    // Sessions recorded without a start anchor fall back to the raw counter
    // origin so the field stays monotonic.
    out.time_in_seconds = if tb.session_start() != 0 {
        tb.seconds_since_start(present.present_start_time)
    } else {
        tb.ticks_to_ms(present.present_start_time) / 1000.0
    };

    out.ms_between_presents = match &chain.last_present {
        Some(last) => tb.delta_unsigned_ms(last.present_start_time, present.present_start_time),
        None => 0.0,
    };

    out.ms_in_present_api = tb.ticks_to_ms(present.time_in_present);
    out.ms_until_render_start =
        tb.delta_signed_ms(present.present_start_time, present.gpu_start_time);
    out.ms_until_render_complete =
        tb.delta_signed_ms(present.present_start_time, present.ready_time);
    out.ms_gpu_duration = tb.ticks_to_ms(present.gpu_duration);
    out.ms_video_duration = tb.ticks_to_ms(present.gpu_video_duration);
    out.ms_since_input = if present.input_time == 0 {
        0.0
    } else {
        tb.delta_unsigned_ms(present.input_time, present.present_start_time)
    };

    out.swap_chain_address = present.swap_chain_address;
    out.runtime = present.runtime;
    out.sync_interval = present.sync_interval;
    out.present_flags = present.present_flags;
    out.allows_tearing = present.supports_tearing;
    out.present_mode = present.present_mode;
}

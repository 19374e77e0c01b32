use crate::metrics::calculator::calculate_ema;
use crate::metrics::chain_state::SwapChainCoreState;
use crate::metrics::types::{FrameMetrics, StateDeltas};
use crate::present::FrameData;
use crate::timebase::TimeBase;

const INPUT_TO_FRAME_START_EMA_ALPHA: f64 = 0.1;

fn instrumented_start_time(present: &FrameData) -> u64 {
    if present.app_sleep_end_time != 0 {
        present.app_sleep_end_time
    } else {
        present.app_sim_start_time
    }
}

fn instrumented_latency(
    tb: &TimeBase,
    present: &FrameData,
    is_displayed: bool,
    is_app_frame: bool,
    screen_time: u64,
) -> Option<f64> {
    if !is_displayed || !is_app_frame {
        return None;
    }
    let start = instrumented_start_time(present);
    if start == 0 {
        return None;
    }
    Some(tb.delta_unsigned_ms(start, screen_time))
}

fn instrumented_render_latency(
    tb: &TimeBase,
    present: &FrameData,
    is_displayed: bool,
    is_app_frame: bool,
    screen_time: u64,
) -> Option<f64> {
    if !is_displayed || !is_app_frame {
        return None;
    }
    if present.app_render_submit_start_time == 0 {
        return None;
    }
    Some(tb.delta_unsigned_ms(present.app_render_submit_start_time, screen_time))
}

fn instrumented_sleep(tb: &TimeBase, present: &FrameData, is_app_frame: bool) -> Option<f64> {
    if !is_app_frame {
        return None;
    }
    if present.app_sleep_start_time == 0 || present.app_sleep_end_time == 0 {
        return None;
    }
    Some(tb.delta_unsigned_ms(present.app_sleep_start_time, present.app_sleep_end_time))
}

fn instrumented_gpu_latency(tb: &TimeBase, present: &FrameData, is_app_frame: bool) -> Option<f64> {
    if !is_app_frame {
        return None;
    }
    let start = instrumented_start_time(present);
    if start == 0 || present.gpu_start_time == 0 {
        return None;
    }
    Some(tb.delta_unsigned_ms(start, present.gpu_start_time))
}

fn between_sim_starts(
    tb: &TimeBase,
    chain: &SwapChainCoreState,
    present: &FrameData,
    is_app_frame: bool,
) -> Option<f64> {
    if !is_app_frame {
        return None;
    }
    // Current sim start depends only on this frame, preferring the platform
    // latency instrumentation over the app provider.
    let current = if present.pcl_sim_start_time != 0 {
        present.pcl_sim_start_time
    } else {
        present.app_sim_start_time
    };
    if chain.last_sim_start_time != 0 && current != 0 && current > chain.last_sim_start_time {
        Some(tb.delta_unsigned_ms(chain.last_sim_start_time, current))
    } else {
        None
    }
}

/// Input-to-photon latency derived from the platform latency instrumentation.
///
/// The input-to-frame-start portion is smoothed with an EMA, and inputs whose
/// frames are dropped keep accumulating sim-to-sim time until one finally
/// reaches the screen.
pub fn calculate_pc_latency(
    tb: &TimeBase,
    chain: &SwapChainCoreState,
    present: &FrameData,
    is_displayed: bool,
    screen_time: u64,
    deltas: &mut StateDeltas,
) -> Option<f64> {
    if !is_displayed {
        if present.pcl_sim_start_time != 0 {
            if present.pcl_input_ping_time != 0 {
                // Dropped frame carrying a fresh input: start accumulating
                // from its input-to-sim delta.
                deltas.new_accumulated_input_to_frame_start = Some(
                    tb.delta_unsigned_ms(present.pcl_input_ping_time, present.pcl_sim_start_time),
                );
            } else if chain.accumulated_input_to_frame_start_time != 0.0 {
                // Another dropped frame for a still-pending input: extend the
                // accumulation by the sim-to-sim gap.
                deltas.new_accumulated_input_to_frame_start = Some(
                    chain.accumulated_input_to_frame_start_time
                        + tb.delta_unsigned_ms(
                            chain.last_received_not_displayed_pcl_sim_start,
                            present.pcl_sim_start_time,
                        ),
                );
            }
            deltas.new_last_received_pcl_sim_start = Some(present.pcl_sim_start_time);
        }
        return None;
    }

    if present.pcl_sim_start_time != 0 {
        if present.pcl_input_ping_time != 0 {
            deltas.new_input_to_frame_start_ema = Some(calculate_ema(
                chain.input_to_frame_start_ema,
                tb.delta_unsigned_ms(present.pcl_input_ping_time, present.pcl_sim_start_time),
                INPUT_TO_FRAME_START_EMA_ALPHA,
            ));
            deltas.new_accumulated_input_to_frame_start = Some(0.0);
            deltas.new_last_received_pcl_sim_start = Some(0);
        } else if chain.accumulated_input_to_frame_start_time != 0.0 {
            // A pending input finally hits the screen; fold the accumulated
            // total into the EMA.
            let total = chain.accumulated_input_to_frame_start_time
                + tb.delta_unsigned_ms(
                    chain.last_received_not_displayed_pcl_sim_start,
                    present.pcl_sim_start_time,
                );
            deltas.new_input_to_frame_start_ema = Some(calculate_ema(
                chain.input_to_frame_start_ema,
                total,
                INPUT_TO_FRAME_START_EMA_ALPHA,
            ));
            deltas.new_accumulated_input_to_frame_start = Some(0.0);
            deltas.new_last_received_pcl_sim_start = Some(0);
        }
    }

    let sim_start_time = if present.pcl_sim_start_time != 0 {
        present.pcl_sim_start_time
    } else {
        chain.last_sim_start_time
    };
    let ema = deltas
        .new_input_to_frame_start_ema
        .unwrap_or(chain.input_to_frame_start_ema);
    if ema != 0.0 && sim_start_time != 0 {
        Some(ema + tb.delta_signed_ms(sim_start_time, screen_time))
    } else {
        None
    }
}

pub fn calculate_instrumented_metrics(
    tb: &TimeBase,
    chain: &SwapChainCoreState,
    present: &FrameData,
    is_displayed: bool,
    is_app_frame: bool,
    screen_time: u64,
    out: &mut FrameMetrics,
) {
    out.ms_instrumented_latency =
        instrumented_latency(tb, present, is_displayed, is_app_frame, screen_time);
    out.ms_instrumented_render_latency =
        instrumented_render_latency(tb, present, is_displayed, is_app_frame, screen_time);
    out.ms_instrumented_sleep = instrumented_sleep(tb, present, is_app_frame);
    out.ms_instrumented_gpu_latency = instrumented_gpu_latency(tb, present, is_app_frame);
    out.ms_between_sim_starts = between_sim_starts(tb, chain, present, is_app_frame);
}

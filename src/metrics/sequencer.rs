use std::collections::VecDeque;

use crate::metrics::calculator::compute_metrics_for_present;
use crate::metrics::chain_state::SwapChainCoreState;
use crate::metrics::types::{ComputedMetrics, MetricsVersion};
use crate::present::{FrameData, FrameType};
use crate::timebase::TimeBase;

/// Per-swap-chain sequencer.
///
/// Presents for one swap chain arrive in `present_start_time` order. Records
/// are released in the same order, but a displayed present is held back until
/// the *next* displayed present arrives so its final on-screen instance can
/// be measured against the successor's screen time. Non-displayed presents
/// arriving in the meantime queue up behind it and release as a block.
#[derive(Debug, Default)]
pub struct UnifiedSwapChain {
    pub core: SwapChainCoreState,
    waiting_displayed: Option<FrameData>,
    blocked: VecDeque<FrameData>,
}

impl UnifiedSwapChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_present_qpc(&self) -> u64 {
        self.core
            .last_present
            .as_ref()
            .map(|p| p.present_start_time)
            .unwrap_or(0)
    }

    /// True once the chain has gone quiet: its newest present started before
    /// `min_timestamp`.
    pub fn is_prunable_before(&self, min_timestamp: u64) -> bool {
        let last = self.last_present_qpc();
        last != 0 && last < min_timestamp
    }

    /// Removes `Repeated` entries adjacent to an `Application` entry from the
    /// display list. Compositor repeats sandwiched next to the real frame
    /// carry no information of their own.
    fn sanitize_displayed_repeats(present: &mut FrameData) {
        let d = &mut present.displayed;
        let mut i = 0;
        while i + 1 < d.len() {
            let a = d[i].0;
            let b = d[i + 1].0;
            if a == FrameType::Application && b == FrameType::Repeated {
                d.remove(i + 1);
            } else if a == FrameType::Repeated && b == FrameType::Application {
                d.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Feeds one present through the sequencer, returning every metrics
    /// record that became computable.
    pub fn enqueue(
        &mut self,
        tb: &TimeBase,
        mut present: FrameData,
        version: MetricsVersion,
    ) -> Vec<ComputedMetrics> {
        Self::sanitize_displayed_repeats(&mut present);

        // The first present only establishes a baseline. If it was displayed
        // it still waits for a successor so its final instance can resolve.
        if self.core.last_present.is_none() {
            let displayed = present.is_displayed();
            self.core.update_after_present(&present);
            if version == MetricsVersion::V2 && displayed {
                self.waiting_displayed = Some(present);
            }
            return Vec::new();
        }

        // V1 has no look-ahead; every present computes immediately.
        if version == MetricsVersion::V1 {
            self.waiting_displayed = None;
            self.blocked.clear();
            return compute_metrics_for_present(tb, &mut present, None, &mut self.core, version);
        }

        let is_displayed = present.is_displayed();

        if is_displayed {
            let mut out = Vec::new();

            // Finalize the previously waiting displayed present against the
            // newcomer. Collapsed-frame corrections mutate the newcomer and
            // must survive into its own waiting slot.
            if let Some(mut prev) = self.waiting_displayed.take() {
                out.extend(compute_metrics_for_present(
                    tb,
                    &mut prev,
                    Some(&mut present),
                    &mut self.core,
                    version,
                ));
            }

            // Non-displayed presents that queued behind it release in order.
            while let Some(mut b) = self.blocked.pop_front() {
                out.extend(compute_metrics_for_present(
                    tb,
                    &mut b,
                    None,
                    &mut self.core,
                    version,
                ));
            }

            // The newcomer's intermediate instances (all but the last) are
            // already resolvable against each other.
            self.waiting_displayed = Some(present);
            if let Some(waiting) = self.waiting_displayed.as_mut() {
                out.extend(compute_metrics_for_present(
                    tb,
                    waiting,
                    None,
                    &mut self.core,
                    version,
                ));
            }
            return out;
        }

        if self.waiting_displayed.is_some() {
            self.blocked.push_back(present);
            return Vec::new();
        }

        compute_metrics_for_present(tb, &mut present, None, &mut self.core, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::present::PresentResult;

    const FREQ: u64 = 10_000_000;

    fn displayed(start: u64, screen: u64) -> FrameData {
        FrameData {
            present_start_time: start,
            time_in_present: 50,
            displayed: vec![(FrameType::Application, screen)],
            final_state: PresentResult::Presented,
            ..Default::default()
        }
    }

    fn dropped(start: u64) -> FrameData {
        FrameData {
            present_start_time: start,
            time_in_present: 50,
            final_state: PresentResult::Discarded,
            ..Default::default()
        }
    }

    #[test]
    fn single_present_only_seeds() {
        let tb = TimeBase::new(FREQ);
        let mut chain = UnifiedSwapChain::new();
        let out = chain.enqueue(&tb, displayed(1000, 1200), MetricsVersion::V2);
        assert!(out.is_empty());
        assert_eq!(chain.last_present_qpc(), 1000);
    }

    #[test]
    fn waiting_present_resolves_when_successor_arrives() {
        let tb = TimeBase::new(FREQ);
        let mut chain = UnifiedSwapChain::new();
        assert!(chain
            .enqueue(&tb, displayed(1000, 1200), MetricsVersion::V2)
            .is_empty());

        let out = chain.enqueue(&tb, displayed(2000, 2200), MetricsVersion::V2);
        assert_eq!(out.len(), 1);
        let m = &out[0].metrics;
        assert_eq!(m.present_start_qpc, 1000);
        assert_eq!(m.screen_time_qpc, 1200);
        // Displayed until the successor's screen time.
        assert!((m.ms_displayed_time - 0.1).abs() < 1e-9);
    }

    #[test]
    fn blocked_presents_release_after_the_waiting_one() {
        let tb = TimeBase::new(FREQ);
        let mut chain = UnifiedSwapChain::new();
        chain.enqueue(&tb, displayed(1000, 1200), MetricsVersion::V2);
        assert!(chain
            .enqueue(&tb, dropped(1300), MetricsVersion::V2)
            .is_empty());
        assert!(chain
            .enqueue(&tb, dropped(1600), MetricsVersion::V2)
            .is_empty());

        let out = chain.enqueue(&tb, displayed(2000, 2200), MetricsVersion::V2);
        let starts: Vec<u64> = out.iter().map(|c| c.metrics.present_start_qpc).collect();
        assert_eq!(starts, vec![1000, 1300, 1600]);
        assert!(out[1].metrics.is_dropped_frame);
        assert!(out[2].metrics.is_dropped_frame);
    }

    #[test]
    fn ready_order_is_monotonic_in_present_start_time() {
        let tb = TimeBase::new(FREQ);
        let mut chain = UnifiedSwapChain::new();
        let mut all = Vec::new();
        let presents = vec![
            displayed(1000, 1100),
            dropped(1200),
            displayed(1400, 1500),
            dropped(1600),
            dropped(1700),
            displayed(1900, 2000),
            displayed(2100, 2200),
        ];
        for p in presents {
            all.extend(chain.enqueue(&tb, p, MetricsVersion::V2));
        }
        let starts: Vec<u64> = all.iter().map(|c| c.metrics.present_start_qpc).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn dropped_present_with_nothing_waiting_releases_immediately() {
        let tb = TimeBase::new(FREQ);
        let mut chain = UnifiedSwapChain::new();
        chain.enqueue(&tb, dropped(1000), MetricsVersion::V2);
        let out = chain.enqueue(&tb, dropped(1200), MetricsVersion::V2);
        assert_eq!(out.len(), 1);
        assert!(out[0].metrics.is_dropped_frame);
    }

    #[test]
    fn v1_is_fifo() {
        let tb = TimeBase::new(FREQ);
        let mut chain = UnifiedSwapChain::new();
        assert!(chain
            .enqueue(&tb, displayed(1000, 1200), MetricsVersion::V1)
            .is_empty());
        let out = chain.enqueue(&tb, displayed(2000, 2200), MetricsVersion::V1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].metrics.present_start_qpc, 2000);
        assert_eq!(out[0].metrics.ms_displayed_time, 0.0);
    }

    #[test]
    fn repeats_adjacent_to_application_are_collapsed() {
        let mut p = FrameData {
            displayed: vec![
                (FrameType::Repeated, 100),
                (FrameType::Application, 200),
                (FrameType::Repeated, 300),
                (FrameType::Nvidia, 400),
            ],
            ..Default::default()
        };
        UnifiedSwapChain::sanitize_displayed_repeats(&mut p);
        assert_eq!(
            p.displayed,
            vec![(FrameType::Application, 200), (FrameType::Nvidia, 400)]
        );
    }

    #[test]
    fn collapsed_nvidia_frame_correction_carries_into_waiting_slot() {
        let tb = TimeBase::new(FREQ);
        let mut chain = UnifiedSwapChain::new();
        chain.enqueue(&tb, displayed(500, 1000), MetricsVersion::V2);

        let runt = FrameData {
            present_start_time: 1000,
            time_in_present: 50,
            flip_delay: 100,
            displayed: vec![(FrameType::Nvidia, 1500)],
            final_state: PresentResult::Presented,
            ..Default::default()
        };
        let out = chain.enqueue(&tb, runt, MetricsVersion::V2);
        // Releases the original waiting present.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].metrics.present_start_qpc, 500);

        // Successor shows earlier than the runt's adjusted screen time; the
        // correction lands on the successor.
        let next = displayed(2000, 1400);
        let out = chain.enqueue(&tb, next, MetricsVersion::V2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].metrics.present_start_qpc, 1000);
        assert!((out[0].metrics.ms_until_displayed - 0.05).abs() < 1e-9);

        let waiting = chain.waiting_displayed.as_ref().unwrap();
        assert_eq!(waiting.flip_delay, 100);
        assert_eq!(waiting.displayed[0].1, 1500);
    }
}

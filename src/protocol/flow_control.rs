//! # Flow Control
//!
//! Binary adaptive send rate driven by measured round trip time.
//!
//! A link starts in `Bad` mode at 10 packets per second. Once the RTT has stayed
//! at or below 250 ms for `penalty_time` seconds it switches to `Good` at 30
//! packets per second. Dropping back to `Bad` within 10 seconds of switching
//! doubles the penalty (up to 60 s); every 10 seconds spent in `Good` halves it
//! (down to 1 s).
//!
//! The send accumulator meters packets: it fills with elapsed time and each
//! packet sent spends one interval of `1 / send_rate` seconds. At most one
//! interval is banked, so a stalled caller cannot burst afterwards.

use tracing::info;

const RTT_THRESHOLD_MS: f32 = 250.0;
const GOOD_SEND_RATE: f32 = 30.0;
const BAD_SEND_RATE: f32 = 10.0;
const INITIAL_PENALTY: f32 = 4.0;
const MIN_PENALTY: f32 = 1.0;
const MAX_PENALTY: f32 = 60.0;
const PENALTY_WINDOW: f32 = 10.0;

/// Current link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    Good,
    Bad,
}

/// Send-rate controller for one link
#[derive(Debug, Clone)]
pub struct FlowControl {
    mode: FlowMode,
    penalty_time: f32,
    good_conditions_time: f32,
    penalty_reduction_accumulator: f32,
    send_accumulator: f32,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl {
    pub fn new() -> Self {
        Self {
            mode: FlowMode::Bad,
            penalty_time: INITIAL_PENALTY,
            good_conditions_time: 0.0,
            penalty_reduction_accumulator: 0.0,
            send_accumulator: 1.0 / BAD_SEND_RATE,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Advance by `dt` seconds given the link's current RTT in milliseconds
    pub fn update(&mut self, dt: f32, rtt_ms: f32) {
        self.update_mode(dt, rtt_ms);
        let interval = self.send_interval();
        self.send_accumulator = (self.send_accumulator + dt).min(interval);
    }

    fn update_mode(&mut self, dt: f32, rtt_ms: f32) {
        if self.mode == FlowMode::Good {
            if rtt_ms > RTT_THRESHOLD_MS {
                info!(rtt_ms, "Flow control dropping to bad mode");
                self.mode = FlowMode::Bad;
                if self.good_conditions_time < PENALTY_WINDOW && self.penalty_time < MAX_PENALTY {
                    self.penalty_time = (self.penalty_time * 2.0).min(MAX_PENALTY);
                    info!(penalty_time = self.penalty_time, "Flow control penalty increased");
                }
                self.good_conditions_time = 0.0;
                self.penalty_reduction_accumulator = 0.0;
                return;
            }

            self.good_conditions_time += dt;
            self.penalty_reduction_accumulator += dt;

            if self.penalty_reduction_accumulator > PENALTY_WINDOW && self.penalty_time > MIN_PENALTY
            {
                self.penalty_time = (self.penalty_time / 2.0).max(MIN_PENALTY);
                info!(penalty_time = self.penalty_time, "Flow control penalty reduced");
                self.penalty_reduction_accumulator = 0.0;
            }
        }

        if self.mode == FlowMode::Bad {
            if rtt_ms <= RTT_THRESHOLD_MS {
                self.good_conditions_time += dt;
            } else {
                self.good_conditions_time = 0.0;
            }

            if self.good_conditions_time > self.penalty_time {
                info!("Flow control upgrading to good mode");
                self.good_conditions_time = 0.0;
                self.penalty_reduction_accumulator = 0.0;
                self.mode = FlowMode::Good;
            }
        }
    }

    pub fn mode(&self) -> FlowMode {
        self.mode
    }

    /// Packets per second allowed in the current mode
    pub fn send_rate(&self) -> f32 {
        match self.mode {
            FlowMode::Good => GOOD_SEND_RATE,
            FlowMode::Bad => BAD_SEND_RATE,
        }
    }

    pub fn send_interval(&self) -> f32 {
        1.0 / self.send_rate()
    }

    pub fn penalty_time(&self) -> f32 {
        self.penalty_time
    }

    /// True when a send slot is available
    pub fn can_send(&self) -> bool {
        self.send_accumulator >= self.send_interval() - f32::EPSILON
    }

    /// Spend one send slot
    pub fn on_packet_sent(&mut self) {
        self.send_accumulator = (self.send_accumulator - self.send_interval()).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(flow: &mut FlowControl, seconds: f32, rtt_ms: f32) {
        let steps = (seconds / 0.1).round() as usize;
        for _ in 0..steps {
            flow.update(0.1, rtt_ms);
        }
    }

    #[test]
    fn test_starts_bad_and_upgrades_after_penalty() {
        let mut flow = FlowControl::new();
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.send_rate(), 10.0);
        run(&mut flow, 3.0, 50.0);
        assert_eq!(flow.mode(), FlowMode::Bad);
        run(&mut flow, 1.5, 50.0);
        assert_eq!(flow.mode(), FlowMode::Good);
        assert_eq!(flow.send_rate(), 30.0);
    }

    #[test]
    fn test_quick_relapse_doubles_penalty() {
        let mut flow = FlowControl::new();
        run(&mut flow, 4.5, 50.0);
        assert_eq!(flow.mode(), FlowMode::Good);
        flow.update(0.1, 400.0);
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.penalty_time(), 8.0);
    }

    #[test]
    fn test_long_good_period_halves_penalty() {
        let mut flow = FlowControl::new();
        run(&mut flow, 4.5, 50.0);
        run(&mut flow, 10.5, 50.0);
        assert_eq!(flow.mode(), FlowMode::Good);
        assert_eq!(flow.penalty_time(), 2.0);
    }

    #[test]
    fn test_penalty_is_capped() {
        let mut flow = FlowControl::new();
        for _ in 0..10 {
            let dur = flow.penalty_time() + 0.5;
            run(&mut flow, dur, 50.0);
            flow.update(0.1, 400.0);
        }
        assert_eq!(flow.penalty_time(), 60.0);
    }

    #[test]
    fn test_send_slots() {
        let mut flow = FlowControl::new();
        assert!(flow.can_send());
        flow.on_packet_sent();
        assert!(!flow.can_send());
        flow.update(0.05, 50.0);
        assert!(!flow.can_send());
        flow.update(0.05, 50.0);
        assert!(flow.can_send());
        // idle time is not banked beyond one slot
        flow.update(5.0, 50.0);
        flow.on_packet_sent();
        assert!(!flow.can_send());
    }
}

// Adaptive "wait for more requests" decision, evaluated once per batching
// round from the observed request arrival interval.
use serde::Deserialize;
use std::time::Duration;

use crate::config::{
    BATCH_POLICY_BASIC, BATCH_POLICY_CUSTOM_PREFIX, BATCH_POLICY_POSITIVE, BATCH_POLICY_STANDARD,
    DEF_BATCH_POLICY,
};

pub(crate) const TURBO_BATCH_ALWAYS: u8 = 0;
pub(crate) const TURBO_BATCH_TIME_BASED: u8 = 1;
pub(crate) const TURBO_BATCH_PROB_BASED: u8 = 2;

/// Strategy parameters, also the schema of `custom{...}` policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub(crate) struct TriggerOptions {
    /// Strategy: always(0), time-based(1), prob-based(2).
    #[serde(default)]
    pub(crate) v: u8,
    /// Caps the observed arrival interval at `n * t`.
    #[serde(default)]
    pub(crate) n: u32,
    /// Wait time in seconds.
    #[serde(default)]
    pub(crate) t: f64,
    /// EWMA weight for the estimators.
    #[serde(default)]
    pub(crate) w: f64,
    /// Decision threshold.
    #[serde(default)]
    pub(crate) p: f64,
    /// Fractional rounding threshold for the adaptive wait size.
    #[serde(default)]
    pub(crate) q: f64,
}

fn preset(policy: &str) -> Option<TriggerOptions> {
    match policy {
        BATCH_POLICY_BASIC => Some(TriggerOptions::default()),
        BATCH_POLICY_STANDARD => Some(TriggerOptions {
            v: TURBO_BATCH_TIME_BASED,
            n: 5,
            t: 0.0001,
            w: 0.2,
            p: 0.8,
            q: 0.8,
        }),
        BATCH_POLICY_POSITIVE => Some(TriggerOptions {
            v: TURBO_BATCH_ALWAYS,
            t: 0.0001,
            ..TriggerOptions::default()
        }),
        _ => None,
    }
}

/// Decides whether a round should wait for more requests:
///
/// - always: fetch more whenever there is time budget.
/// - time-based: fetch more if `est_arrival_interval < p * t`, where the
///   estimate is an EWMA of arrival intervals clamped at `n * t`.
/// - prob-based: fetch more if `est_fetch_more_prob > p`, where the estimate
///   is an EWMA of "did this request arrive within `t`".
pub(crate) struct AdaptiveTrigger {
    opts: TriggerOptions,
    est_fetch_more_prob: f64,
    est_arrival_interval: f64,
    max_arrival_interval: f64,
}

impl AdaptiveTrigger {
    /// Build a trigger from a policy string. The boolean is false when the
    /// policy was invalid and the default preset was substituted.
    pub(crate) fn from_policy(policy: &str) -> (Self, bool) {
        if let Some(opts) = preset(policy) {
            return (Self::new(opts), true);
        }
        let raw = policy.strip_prefix(BATCH_POLICY_CUSTOM_PREFIX).unwrap_or(policy);
        match serde_json::from_str::<TriggerOptions>(raw.trim()) {
            Ok(opts) => (Self::new(opts), true),
            Err(_) => {
                let fallback = preset(DEF_BATCH_POLICY).unwrap_or_default();
                (Self::new(fallback), false)
            }
        }
    }

    fn new(opts: TriggerOptions) -> Self {
        Self {
            opts,
            est_fetch_more_prob: 0.0,
            est_arrival_interval: 0.0,
            max_arrival_interval: 0.0,
        }
    }

    fn turbo_wait_seconds(&self) -> f64 {
        self.opts.t
    }

    pub(crate) fn turbo_wait_time(&self) -> Duration {
        Duration::from_secs_f64(self.opts.t)
    }

    pub(crate) fn need_fetch_more(&mut self, arrival_interval: Duration) -> bool {
        if self.opts.v == TURBO_BATCH_TIME_BASED {
            let mut this_interval = arrival_interval.as_secs_f64();
            if self.max_arrival_interval == 0.0 {
                self.max_arrival_interval = self.turbo_wait_seconds() * f64::from(self.opts.n);
            }
            if this_interval > self.max_arrival_interval {
                this_interval = self.max_arrival_interval;
            }
            if self.est_arrival_interval == 0.0 {
                self.est_arrival_interval = this_interval;
            } else {
                self.est_arrival_interval =
                    self.opts.w * this_interval + (1.0 - self.opts.w) * self.est_arrival_interval;
            }
            self.est_arrival_interval < self.turbo_wait_seconds() * self.opts.p
        } else if self.opts.v == TURBO_BATCH_PROB_BASED {
            let this_prob = if arrival_interval.as_secs_f64() < self.turbo_wait_seconds() {
                1.0
            } else {
                0.0
            };
            self.est_fetch_more_prob =
                self.opts.w * this_prob + (1.0 - self.opts.w) * self.est_fetch_more_prob;
            self.est_fetch_more_prob > self.opts.p
        } else {
            true
        }
    }

    /// Preferred wait size for the round: the realized-size EWMA rounded up
    /// when its fractional part reaches `q`. `Always` sticks to the default.
    pub(crate) fn preferred_batch_wait_size(
        &self,
        avg_batch_wait_size: f64,
        default_batch_wait_size: usize,
    ) -> usize {
        if self.opts.v == TURBO_BATCH_ALWAYS {
            return default_batch_wait_size;
        }
        let mut size = avg_batch_wait_size.trunc() as usize;
        if avg_batch_wait_size.fract() >= self.opts.q {
            size += 1;
        }
        size
    }

    #[cfg(test)]
    pub(crate) fn est_arrival_interval(&self) -> f64 {
        self.est_arrival_interval
    }
}

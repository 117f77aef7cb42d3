//! Reincarnation Server
//!
//! Restarts faulted services after an exponentially growing delay and gives
//! up on services that keep failing. A service that gives up is marked
//! permanently faulted and stays down until an operator resets it.
//!
//! # Restart decision
//!
//! ```text
//! fault -> permanent?  already permanent
//!                      | restarts >= max and no stable run since last restart
//!                      | last restart younger than the cooldown
//!       -> otherwise   restart at now + delay
//!                      delay = base, then previous * factor, capped at max
//! ```
//!
//! Restarts happen in two phases so the server never holds a reference to the
//! kernel: [`ReincarnationServer::take_due`] hands out the services whose
//! restart time arrived, the caller restarts them and reports back through
//! [`ReincarnationServer::record_restart`].

use core::time::Duration;

use serde::{Deserialize, Serialize};

use super::FaultKind;
use crate::config::micros;
use crate::service::{MAX_SERVICES, ServiceId};
use crate::KernelResult;

/// Restart policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Restarts allowed before giving up
    pub max_restarts: u32,
    /// Delay before the first restart
    #[serde(with = "micros")]
    pub restart_delay: Duration,
    /// Delay multiplier for each further restart
    pub backoff_factor: f64,
    /// Delay cap
    #[serde(with = "micros")]
    pub max_delay: Duration,
    /// Stable run time after which the restart budget is earned back.
    ///
    /// Measured from the last restart to a later successful execution, not
    /// from the last success to now: a service that stops running never
    /// earns its budget back by idling.
    #[serde(with = "micros")]
    pub reset_after: Duration,
    /// Minimum time between a restart and the next fault
    #[serde(with = "micros")]
    pub cooldown: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(1),
            reset_after: Duration::from_secs(10),
            cooldown: Duration::from_millis(50),
        }
    }
}

impl RestartPolicy {
    /// Delay following `previous`, capped at `max_delay`
    pub fn next_delay(&self, previous: Duration) -> Duration {
        Duration::try_from_secs_f64(previous.as_secs_f64() * self.backoff_factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Restart bookkeeping of one service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestartHistory {
    /// Restarts since the budget was last reset
    pub restart_count: u32,
    /// Time of the last restart
    pub last_restart: Option<Duration>,
    /// Time of the last successful execution
    pub last_success: Option<Duration>,
    /// Most recent fault
    pub last_fault: Option<FaultKind>,
    /// Lifetime restarts
    pub total_restarts: u32,
    /// Delay used for the latest scheduled restart
    pub current_delay: Duration,
    /// Automatic restarts abandoned
    pub permanent_fault: bool,
}

impl RestartHistory {
    /// A success was recorded at least `reset_after` after the last restart
    fn earned_reset(&self, reset_after: Duration) -> bool {
        match (self.last_success, self.last_restart) {
            (Some(success), Some(restart)) => success.saturating_sub(restart) >= reset_after,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Outcome of reporting a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// Restart scheduled
    Scheduled {
        /// Restart time
        at: Duration,
        /// Backoff delay used
        delay: Duration,
    },
    /// The service just became permanently faulted
    Permanent,
    /// The service was already permanently faulted
    AlreadyPermanent,
}

/// Something that can restart services
pub trait RestartTarget {
    /// Restart `id`
    fn restart_service(&mut self, id: ServiceId) -> KernelResult<()>;
}

/// Reincarnation statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReincarnationStats {
    /// Restarts attempted
    pub total_restarts: u64,
    /// Restarts that succeeded
    pub successful_restarts: u64,
    /// Restarts that failed
    pub failed_restarts: u64,
    /// Restarts waiting for their time
    pub pending_restarts: usize,
    /// Services given up on
    pub permanently_faulted: usize,
}

/// Reincarnation server
#[derive(Debug)]
pub struct ReincarnationServer {
    default_policy: RestartPolicy,
    policies: [Option<RestartPolicy>; MAX_SERVICES],
    histories: [Option<RestartHistory>; MAX_SERVICES],
    pending: [Option<Duration>; MAX_SERVICES],
    total_restarts: u64,
    successful_restarts: u64,
    failed_restarts: u64,
}

impl ReincarnationServer {
    /// Server applying `default_policy` to every service without an override
    pub const fn new(default_policy: RestartPolicy) -> Self {
        Self {
            default_policy,
            policies: [None; MAX_SERVICES],
            histories: [None; MAX_SERVICES],
            pending: [None; MAX_SERVICES],
            total_restarts: 0,
            successful_restarts: 0,
            failed_restarts: 0,
        }
    }

    /// Override the policy of `id`
    pub fn set_policy(&mut self, id: ServiceId, policy: RestartPolicy) {
        if let Some(slot) = self.policies.get_mut(id.index()) {
            *slot = Some(policy);
        }
    }

    /// Policy in force for `id`
    pub fn policy(&self, id: ServiceId) -> RestartPolicy {
        self.policies
            .get(id.index())
            .copied()
            .flatten()
            .unwrap_or(self.default_policy)
    }

    /// History of `id`, if it ever faulted
    pub fn history(&self, id: ServiceId) -> Option<&RestartHistory> {
        self.histories.get(id.index())?.as_ref()
    }

    fn history_mut(&mut self, id: ServiceId) -> Option<&mut RestartHistory> {
        self.histories.get_mut(id.index())?.as_mut()
    }

    /// Forget the history of `id`
    pub fn clear_history(&mut self, id: ServiceId) {
        if let Some(slot) = self.histories.get_mut(id.index()) {
            *slot = None;
        }
    }

    /// Decide what happens after a fault of `id` at `now`
    pub fn on_service_fault(&mut self, id: ServiceId, fault: FaultKind, now: Duration) -> FaultDecision {
        let policy = self.policy(id);
        let pending = self.pending_restart(id);
        let Some(slot) = self.histories.get_mut(id.index()) else {
            return FaultDecision::Permanent;
        };
        let history = slot.get_or_insert_with(RestartHistory::default);
        history.last_fault = Some(fault);

        if history.permanent_fault {
            return FaultDecision::AlreadyPermanent;
        }
        if let Some(at) = pending {
            return FaultDecision::Scheduled {
                at,
                delay: history.current_delay,
            };
        }

        let exhausted = history.restart_count >= policy.max_restarts;
        if exhausted && history.earned_reset(policy.reset_after) {
            history.restart_count = 0;
        } else {
            let cooling = history
                .last_restart
                .is_some_and(|last| now.saturating_sub(last) < policy.cooldown);
            if exhausted || cooling {
                history.permanent_fault = true;
                if let Some(entry) = self.pending.get_mut(id.index()) {
                    *entry = None;
                }
                klog!(
                    error,
                    id,
                    "giving up after {} restarts (last fault {})",
                    history.restart_count,
                    fault
                );
                return FaultDecision::Permanent;
            }
        }

        let delay = if history.restart_count == 0 {
            policy.restart_delay
        } else {
            policy.next_delay(history.current_delay)
        };
        history.current_delay = delay;
        let at = now + delay;
        if let Some(entry) = self.pending.get_mut(id.index()) {
            *entry = Some(at);
        }
        klog!(info, id, "restart scheduled in {:?} after {}", delay, fault);
        FaultDecision::Scheduled { at, delay }
    }

    /// Remove and return the services whose restart time has arrived
    pub fn take_due(&mut self, now: Duration) -> heapless::Vec<ServiceId, MAX_SERVICES> {
        let mut due = heapless::Vec::new();
        for (index, entry) in self.pending.iter_mut().enumerate() {
            if entry.is_some_and(|at| at <= now) {
                *entry = None;
                let _ = due.push(ServiceId::new(u8::try_from(index).unwrap_or(u8::MAX)));
            }
        }
        due
    }

    /// Count a restart of `id` that is about to happen at `now`
    pub fn begin_restart(&mut self, id: ServiceId, now: Duration) {
        if let Some(slot) = self.histories.get_mut(id.index()) {
            let history = slot.get_or_insert_with(RestartHistory::default);
            history.restart_count += 1;
            history.total_restarts += 1;
            history.last_restart = Some(now);
        }
    }

    /// Tally the outcome of a restart
    pub fn record_restart(&mut self, succeeded: bool) {
        self.total_restarts += 1;
        if succeeded {
            self.successful_restarts += 1;
        } else {
            self.failed_restarts += 1;
        }
    }

    /// Restart every due service through `target`; returns how many were due
    pub fn process_pending<T: RestartTarget>(&mut self, now: Duration, target: &mut T) -> usize {
        let due = self.take_due(now);
        for &id in &due {
            self.begin_restart(id, now);
            let result = target.restart_service(id);
            if let Err(err) = &result {
                klog!(warn, id, "restart failed: {}", err);
            }
            self.record_restart(result.is_ok());
        }
        due.len()
    }

    /// Record a successful execution of `id`.
    ///
    /// After `reset_after` without a fault since the last restart the restart
    /// budget and backoff return to their base values.
    pub fn notify_success(&mut self, id: ServiceId, now: Duration) {
        let policy = self.policy(id);
        let Some(history) = self.history_mut(id) else {
            return;
        };
        history.last_success = Some(now);
        let stable = history
            .last_restart
            .is_none_or(|last| now.saturating_sub(last) >= policy.reset_after);
        if stable && history.restart_count > 0 {
            history.restart_count = 0;
            history.current_delay = policy.restart_delay;
            klog!(debug, id, "restart budget restored");
        }
    }

    /// Automatic restarts of `id` were abandoned
    pub fn is_permanently_faulted(&self, id: ServiceId) -> bool {
        self.history(id).is_some_and(|history| history.permanent_fault)
    }

    /// Re-enable automatic restarts of `id` with a fresh budget
    pub fn reset_permanent_fault(&mut self, id: ServiceId) {
        let base = self.policy(id).restart_delay;
        if let Some(history) = self.history_mut(id) {
            history.permanent_fault = false;
            history.restart_count = 0;
            history.current_delay = base;
        }
    }

    /// Scheduled restart time of `id`
    pub fn pending_restart(&self, id: ServiceId) -> Option<Duration> {
        self.pending.get(id.index()).copied().flatten()
    }

    /// Scheduled restarts in id order
    pub fn pending_restarts(&self) -> impl Iterator<Item = (ServiceId, Duration)> + '_ {
        self.pending.iter().enumerate().filter_map(|(index, at)| {
            let id = ServiceId::new(u8::try_from(index).ok()?);
            at.map(|at| (id, at))
        })
    }

    /// Drop a scheduled restart of `id`
    pub fn cancel_pending(&mut self, id: ServiceId) {
        if let Some(entry) = self.pending.get_mut(id.index()) {
            *entry = None;
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ReincarnationStats {
        ReincarnationStats {
            total_restarts: self.total_restarts,
            successful_restarts: self.successful_restarts,
            failed_restarts: self.failed_restarts,
            pending_restarts: self.pending.iter().flatten().count(),
            permanently_faulted: self
                .histories
                .iter()
                .flatten()
                .filter(|history| history.permanent_fault)
                .count(),
        }
    }
}

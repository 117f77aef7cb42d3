//! EDF Scheduler
//!
//! Earliest-deadline-first dispatch over the services of one kernel.
//!
//! # Dispatch levels
//!
//! ```text
//! P0..P3   interrupt handlers (fixed priority, run before dispatch)
//! P4..P8   service tasks, ordered by absolute deadline
//! idle     nothing ready
//! ```
//!
//! # Jobs
//!
//! Every release of a periodic service (and every sporadic submission) becomes
//! a [`Task`] with an absolute deadline and an execution budget seeded from
//! the service WCET. Each executed tick consumes the tick length from the
//! budget; the task leaves the ready set once the budget is spent.
//!
//! The ready set is a fixed-capacity min-heap ordered by absolute deadline,
//! then service id, then release sequence. Stale tasks (their service is no
//! longer `Running`) and late tasks (deadline already passed) are discarded
//! when they reach the top; late tasks count as a deadline miss.

use core::cmp::Ordering;
use core::time::Duration;

use heapless::binary_heap::{BinaryHeap, Min};
use serde::Serialize;
use thiserror_no_std::Error;

use crate::service::{MAX_SERVICES, ServiceId, ServiceState, ServiceTable};

/// Capacity of the ready set
pub const MAX_READY_TASKS: usize = 32;

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// No room for another ready task
    #[error("ready queue full")]
    ReadyQueueFull,
    /// Sporadic job for a service that is not running
    #[error("service {0} is not running")]
    NotRunning(ServiceId),
}

/// Task states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Waiting in the ready set
    Ready,
    /// Selected by the last dispatch
    Running,
    /// Parked while its service waits on IPC
    Blocked,
    /// Budget spent
    Completed,
}

/// One job of a service
#[derive(Debug, Clone, Copy)]
pub struct Task {
    /// Owning service
    pub service: ServiceId,
    /// Release time
    pub release: Duration,
    /// Absolute deadline
    pub deadline: Duration,
    /// Execution budget at release
    pub budget: Duration,
    /// Budget left
    pub remaining: Duration,
    /// Task state
    pub state: TaskState,
    /// Release sequence number
    pub sequence: u64,
}

impl Task {
    const fn key(&self) -> (Duration, ServiceId, u64) {
        (self.deadline, self.service, self.sequence)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A task discarded because its deadline passed before it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeadlineMiss {
    /// Owning service
    pub service: ServiceId,
    /// Missed absolute deadline
    pub deadline: Duration,
    /// Time the miss was detected
    pub detected: Duration,
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    /// Tasks in the ready set
    pub ready_tasks: usize,
    /// Tasks parked on IPC
    pub blocked_tasks: usize,
    /// Dispatches that changed the running task
    pub context_switches: u64,
    /// Dispatches that found nothing to run
    pub idle_ticks: u64,
    /// Dispatches
    pub total_ticks: u64,
    /// Share of idle dispatches in percent
    pub idle_percent: f64,
    /// Share of busy dispatches in percent
    pub cpu_percent: f64,
    /// Executions that consumed more than the budget left
    pub wcet_overruns: u64,
    /// Tasks released or submitted
    pub released: u64,
    /// Tasks discarded as late
    pub deadline_misses: u64,
    /// Releases lost to a full ready set
    pub overflows: u64,
}

/// EDF scheduler
#[derive(Debug)]
pub struct Scheduler {
    ready: BinaryHeap<Task, Min, MAX_READY_TASKS>,
    blocked: heapless::Vec<Task, MAX_SERVICES>,
    current: Option<Task>,
    completed: Option<Task>,
    previous: Option<(ServiceId, u64)>,
    next_release: [Option<Duration>; MAX_SERVICES],
    misses: heapless::Vec<DeadlineMiss, MAX_READY_TASKS>,
    sequence: u64,
    context_switches: u64,
    idle_ticks: u64,
    total_ticks: u64,
    wcet_overruns: u64,
    released: u64,
    deadline_misses: u64,
    overflows: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Empty scheduler
    pub const fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            blocked: heapless::Vec::new(),
            current: None,
            completed: None,
            previous: None,
            next_release: [None; MAX_SERVICES],
            misses: heapless::Vec::new(),
            sequence: 0,
            context_switches: 0,
            idle_ticks: 0,
            total_ticks: 0,
            wcet_overruns: 0,
            released: 0,
            deadline_misses: 0,
            overflows: 0,
        }
    }

    /// Release due periodic tasks and select the earliest-deadline service.
    ///
    /// Late tasks found on the way are recorded on their service and kept in
    /// [`Self::recent_misses`] until the next call.
    pub fn schedule(&mut self, services: &mut ServiceTable, now: Duration) -> Option<ServiceId> {
        self.total_ticks += 1;
        self.misses.clear();
        if let Some(mut task) = self.current.take() {
            task.state = TaskState::Ready;
            self.enqueue(task);
        }
        self.release_periodic(services, now);

        while let Some(task) = self.ready.pop() {
            if services.state(task.service) != Some(ServiceState::Running) {
                continue;
            }
            if now > task.deadline {
                self.record_miss(services, task, now);
                continue;
            }

            let identity = (task.service, task.sequence);
            if self.previous != Some(identity) {
                self.context_switches += 1;
                self.previous = Some(identity);
            }
            self.current = Some(Task {
                state: TaskState::Running,
                ..task
            });
            klog!(trace, task.service, "dispatched, deadline {:?}", task.deadline);
            return Some(task.service);
        }

        self.idle_ticks += 1;
        None
    }

    fn release_periodic(&mut self, services: &ServiceTable, now: Duration) {
        for service in services.iter() {
            if service.state() != ServiceState::Running || !service.is_periodic() {
                continue;
            }
            let Some(slot) = self.next_release.get_mut(service.id().index()) else {
                continue;
            };
            let release = slot.unwrap_or(now);
            if release > now {
                continue;
            }
            *slot = Some(release + service.period());

            self.sequence += 1;
            self.released += 1;
            self.enqueue(Task {
                service: service.id(),
                release: now,
                deadline: now + service.deadline(),
                budget: service.wcet(),
                remaining: service.wcet(),
                state: TaskState::Ready,
                sequence: self.sequence,
            });
        }
    }

    fn enqueue(&mut self, task: Task) -> bool {
        match self.ready.push(task) {
            Ok(()) => true,
            Err(task) => {
                self.overflows += 1;
                klog!(warn, task.service, "ready queue full, task dropped");
                false
            }
        }
    }

    fn record_miss(&mut self, services: &mut ServiceTable, task: Task, now: Duration) {
        self.deadline_misses += 1;
        if let Some(service) = services.get_mut(task.service) {
            service.record_deadline_miss();
        }
        let _ = self.misses.push(DeadlineMiss {
            service: task.service,
            deadline: task.deadline,
            detected: now,
        });
    }

    /// Submit a sporadic job with an absolute deadline
    pub fn submit_sporadic(
        &mut self,
        service: ServiceId,
        wcet: Duration,
        deadline: Duration,
        now: Duration,
    ) -> Result<(), SchedulerError> {
        self.sequence += 1;
        let task = Task {
            service,
            release: now,
            deadline,
            budget: wcet,
            remaining: wcet,
            state: TaskState::Ready,
            sequence: self.sequence,
        };
        self.ready.push(task).map_err(|_| {
            self.overflows += 1;
            SchedulerError::ReadyQueueFull
        })?;
        self.released += 1;
        Ok(())
    }

    /// Charge `consumed` to the running task.
    ///
    /// Returns `true` once the budget is spent and the task left the ready set.
    pub fn complete_current(&mut self, consumed: Duration) -> bool {
        let Some(mut task) = self.current.take() else {
            return false;
        };
        if consumed > task.remaining {
            self.wcet_overruns += 1;
        }
        task.remaining = task.remaining.saturating_sub(consumed);
        if task.remaining.is_zero() {
            task.state = TaskState::Completed;
            self.completed = Some(task);
            return true;
        }
        task.state = TaskState::Ready;
        self.enqueue(task);
        false
    }

    /// Charge `consumed` to the running task and park it until [`Self::unblock`]
    pub fn block_current(&mut self, consumed: Duration) {
        let Some(mut task) = self.current.take() else {
            return;
        };
        task.remaining = task.remaining.saturating_sub(consumed);
        if task.remaining.is_zero() {
            return;
        }
        task.state = TaskState::Blocked;
        if self.blocked.push(task).is_err() {
            self.overflows += 1;
        }
    }

    /// Return the parked task of `service` to the ready set
    pub fn unblock(&mut self, service: ServiceId) {
        if let Some(position) = self.blocked.iter().position(|task| task.service == service) {
            let mut task = self.blocked.swap_remove(position);
            task.state = TaskState::Ready;
            self.enqueue(task);
        }
    }

    /// Drop the running task without charging it
    pub fn abort_current(&mut self) {
        self.current = None;
    }

    /// Forget every task and the release grid of `service`
    pub fn forget(&mut self, service: ServiceId) {
        if let Some(slot) = self.next_release.get_mut(service.index()) {
            *slot = None;
        }
        if self.current.is_some_and(|task| task.service == service) {
            self.current = None;
        }
        self.blocked.retain(|task| task.service != service);

        let mut kept = BinaryHeap::new();
        for task in self.ready.iter().filter(|task| task.service != service) {
            let _ = kept.push(*task);
        }
        self.ready = kept;
    }

    /// Ready tasks whose deadline already passed
    pub fn missed_deadlines(&self, now: Duration) -> heapless::Vec<Task, MAX_READY_TASKS> {
        let mut missed = heapless::Vec::new();
        for task in self.ready.iter().filter(|task| now > task.deadline) {
            let _ = missed.push(*task);
        }
        missed
    }

    /// Deadline misses detected by the last [`Self::schedule`]
    pub fn recent_misses(&self) -> &[DeadlineMiss] {
        &self.misses
    }

    /// Task selected by the last dispatch
    pub const fn current(&self) -> Option<&Task> {
        self.current.as_ref()
    }

    /// Job that spent its budget most recently
    pub const fn last_completed(&self) -> Option<&Task> {
        self.completed.as_ref()
    }

    /// Tasks in the ready set
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Next release time of a periodic service
    pub fn next_release(&self, service: ServiceId) -> Option<Duration> {
        self.next_release.get(service.index()).copied().flatten()
    }

    /// Σ WCET / period over running periodic services
    pub fn utilization(&self, services: &ServiceTable) -> f64 {
        services
            .iter()
            .filter(|service| service.state() == ServiceState::Running && service.is_periodic())
            .map(|service| service.wcet().as_secs_f64() / service.period().as_secs_f64())
            .sum()
    }

    /// EDF feasibility test: utilization at most 1
    pub fn is_schedulable(&self, services: &ServiceTable) -> bool {
        self.utilization(services) <= 1.0
    }

    /// Drop every task, the release grid and the counters
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SchedulerStats {
        let idle_percent = if self.total_ticks == 0 {
            100.0
        } else {
            self.idle_ticks as f64 / self.total_ticks as f64 * 100.0
        };
        SchedulerStats {
            ready_tasks: self.ready.len(),
            blocked_tasks: self.blocked.len(),
            context_switches: self.context_switches,
            idle_ticks: self.idle_ticks,
            total_ticks: self.total_ticks,
            idle_percent,
            cpu_percent: 100.0 - idle_percent,
            wcet_overruns: self.wcet_overruns,
            released: self.released,
            deadline_misses: self.deadline_misses,
            overflows: self.overflows,
        }
    }
}

/// Relative deadline equivalent to a legacy fixed priority (P4..P8).
///
/// Other levels fall back to `base`.
pub const fn priority_to_deadline(priority: u8, base: Duration) -> Duration {
    match priority {
        4 => Duration::from_millis(1),
        5 => Duration::from_millis(10),
        6 => Duration::from_millis(100),
        7 => Duration::from_secs(1),
        8 => Duration::from_secs(10),
        _ => base,
    }
}

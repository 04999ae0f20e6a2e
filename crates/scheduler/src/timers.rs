//! Periodic re-evaluation of resources.
//!
//! Fixed-period intervals arm one timer per resource; cron intervals run one
//! global task that fans out to every resource, and then no per-resource
//! timer of that kind exists. Timers only emit [`TimerEvent`]s; the
//! scheduler decides what to do with them.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use converge_core::{IntervalSetting, ResourceId};
use cron::Schedule;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::state::{Blocked, ResourceState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    Deploy(ResourceId),
    Repair(ResourceId),
    GlobalDeploy,
    GlobalRepair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Deploy,
    Repair,
}

struct ResourceTimer {
    kind: TimerKind,
    due: Instant,
    handle: JoinHandle<()>,
}

pub struct TimerManager {
    deploy_interval: IntervalSetting,
    repair_interval: IntervalSetting,
    timers: HashMap<ResourceId, ResourceTimer>,
    global: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<TimerEvent>,
}

impl TimerManager {
    pub fn new(
        deploy_interval: IntervalSetting,
        repair_interval: IntervalSetting,
        events: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            deploy_interval,
            repair_interval,
            timers: HashMap::new(),
            global: Vec::new(),
            events,
        }
    }

    pub fn deploy_interval(&self) -> &IntervalSetting {
        &self.deploy_interval
    }

    pub fn repair_interval(&self) -> &IntervalSetting {
        &self.repair_interval
    }

    /// Start the global cron tasks, if any interval is a cron expression.
    pub fn start(&mut self) {
        for handle in self.global.drain(..) {
            handle.abort();
        }
        let globals = [
            (self.deploy_interval.cron_schedule(), TimerEvent::GlobalDeploy),
            (self.repair_interval.cron_schedule(), TimerEvent::GlobalRepair),
        ];
        for (schedule, event) in globals {
            if let Some(schedule) = schedule {
                info!(event = ?event, "starting global cron timer");
                self.global.push(spawn_cron(schedule, event, self.events.clone()));
            }
        }
    }

    /// Re-arm the timer of one resource from its current state.
    ///
    /// Blocked and orphaned resources get no timer. Compliant and
    /// temporarily blocked resources only get a repair timer; everything else
    /// gets whichever of deploy and repair comes first.
    pub fn update_timer(&mut self, id: &ResourceId, state: &ResourceState) {
        self.remove_timer(id);
        if state.is_orphan || state.blocked == Blocked::Blocked {
            return;
        }

        let repair = self.repair_interval.period().map(|p| (TimerKind::Repair, p));
        let next = if state.blocked == Blocked::TemporarilyBlocked || state.is_compliant() {
            repair
        } else {
            let deploy = self.deploy_interval.period().map(|p| (TimerKind::Deploy, p));
            match (deploy, repair) {
                (Some(d), Some(r)) => Some(if r.1 < d.1 { r } else { d }),
                (d, r) => d.or(r),
            }
        };
        let Some((kind, period)) = next else {
            return;
        };

        let event = match kind {
            TimerKind::Deploy => TimerEvent::Deploy(id.clone()),
            TimerKind::Repair => TimerEvent::Repair(id.clone()),
        };
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let _ = events.send(event);
        });
        self.timers.insert(
            id.clone(),
            ResourceTimer {
                kind,
                due: Instant::now() + period,
                handle,
            },
        );
    }

    pub fn remove_timer(&mut self, id: &ResourceId) {
        if let Some(timer) = self.timers.remove(id) {
            timer.handle.abort();
        }
    }

    /// Apply new interval settings and re-arm every timer right away.
    pub fn reload_config<'a>(
        &mut self,
        deploy_interval: IntervalSetting,
        repair_interval: IntervalSetting,
        states: impl IntoIterator<Item = (&'a ResourceId, &'a ResourceState)>,
    ) {
        debug!(deploy = %deploy_interval, repair = %repair_interval, "reloading timer settings");
        self.deploy_interval = deploy_interval;
        self.repair_interval = repair_interval;
        self.start();
        for (id, state) in states {
            self.update_timer(id, state);
        }
    }

    /// Kind and deadline of the armed timer of `id`.
    pub fn next_due(&self, id: &ResourceId) -> Option<(TimerKind, Instant)> {
        self.timers.get(id).map(|t| (t.kind, t.due))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn has_global_timers(&self) -> bool {
        !self.global.is_empty()
    }

    pub fn stop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        for handle in self.global.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_cron(schedule: Schedule, event: TimerEvent, events: mpsc::UnboundedSender<TimerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        for next in schedule.upcoming(Utc) {
            let now = Utc::now();
            if next < now {
                continue;
            }
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            if events.send(event.clone()).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use converge_core::DeployResult;

    use super::*;

    fn rid(name: &str) -> ResourceId {
        ResourceId::parse(format!("t::R[a,k={name}]")).unwrap()
    }

    fn manager(deploy: u64, repair: u64) -> (TimerManager, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let every = |secs| {
            if secs == 0 {
                IntervalSetting::Disabled
            } else {
                IntervalSetting::Every(Duration::from_secs(secs))
            }
        };
        (TimerManager::new(every(deploy), every(repair), tx), rx)
    }

    fn compliant() -> ResourceState {
        let mut state = ResourceState::new("h", false);
        state.deployed_hash = Some("h".into());
        state.last_deploy_result = DeployResult::Deployed;
        state
    }

    fn failed() -> ResourceState {
        let mut state = ResourceState::new("h", false);
        state.deployed_hash = Some("h".into());
        state.last_deploy_result = DeployResult::Failed;
        state
    }

    #[tokio::test(start_paused = true)]
    async fn non_compliant_resource_gets_shortest_interval() {
        let (mut timers, mut rx) = manager(600, 86_400);
        timers.update_timer(&rid("x"), &failed());
        assert_eq!(timers.next_due(&rid("x")).unwrap().0, TimerKind::Deploy);

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(rx.try_recv().unwrap(), TimerEvent::Deploy(rid("x")));
    }

    #[tokio::test(start_paused = true)]
    async fn compliant_and_temporarily_blocked_only_repair() {
        let (mut timers, mut rx) = manager(10, 100);
        timers.update_timer(&rid("ok"), &compliant());
        let mut waiting = failed();
        waiting.blocked = Blocked::TemporarilyBlocked;
        timers.update_timer(&rid("tb"), &waiting);

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(51)).await;
        let mut fired = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        fired.sort_by_key(|e| format!("{e:?}"));
        assert_eq!(fired, vec![TimerEvent::Repair(rid("ok")), TimerEvent::Repair(rid("tb"))]);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_resource_timer_is_cancelled() {
        let (mut timers, mut rx) = manager(10, 100);
        timers.update_timer(&rid("x"), &failed());
        let mut blocked = failed();
        blocked.blocked = Blocked::Blocked;
        timers.update_timer(&rid("x"), &blocked);
        assert!(timers.is_empty());

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reload_rearms_with_new_interval() {
        let (mut timers, mut rx) = manager(0, 3_600);
        let state = compliant();
        timers.update_timer(&rid("x"), &state);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let id = rid("x");
        timers.reload_config(
            IntervalSetting::Disabled,
            IntervalSetting::Every(Duration::from_secs(30)),
            [(&id, &state)],
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(rx.try_recv().unwrap(), TimerEvent::Repair(rid("x")));
    }

    #[tokio::test(start_paused = true)]
    async fn cron_interval_disables_per_resource_timers() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timers = TimerManager::new(
            IntervalSetting::parse("*/5 * * * *").unwrap(),
            IntervalSetting::Disabled,
            tx,
        );
        timers.start();
        assert!(timers.has_global_timers());

        timers.update_timer(&rid("x"), &failed());
        assert!(timers.next_due(&rid("x")).is_none());
        timers.stop();
        assert!(!timers.has_global_timers());
    }
}

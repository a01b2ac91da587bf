//! Presence-based priority arbitration
//!
//! Sibling instances sharing one logical node name announce their
//! priority on the bus. Each instance independently derives its tier from
//! the sorted set of known resource ids, so the cluster converges on
//! distinct priorities without a coordinator. The tier-1 instance
//! periodically promotes itself to the master slot, stepping down if a
//! competing claim shows up. An overloaded instance withdraws to priority
//! -1 until its live queue drains.

use busrelay_core::config::ArbiterConfig;
use busrelay_core::FlowSignal;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Timing knobs for the arbiter, converted once from config
#[derive(Debug, Clone, Copy)]
pub struct ArbiterSettings {
    pub drift_interval: Duration,
    pub master_delay: Duration,
    pub stepdown_delay: Duration,
}

impl From<&ArbiterConfig> for ArbiterSettings {
    fn from(config: &ArbiterConfig) -> Self {
        Self {
            drift_interval: Duration::from_secs(config.drift_interval_secs),
            master_delay: Duration::from_millis(config.master_delay_ms),
            stepdown_delay: Duration::from_millis(config.stepdown_delay_ms),
        }
    }
}

/// One presence announcement, inbound or outbound.
///
/// Priority -1 means the instance is unavailable (departed or
/// overloaded); siblings drop it from their view.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PresenceEvent {
    pub resource: String,
    pub priority: i32,
}

/// Deferred action the task loop schedules after a state change
#[derive(Debug, PartialEq, Eq)]
enum Followup {
    ScheduleMasterClaim,
    ScheduleStepdown,
}

/// Pure arbitration state machine; all timing lives in the task loop.
struct ArbiterCore {
    resource: String,
    priority: i32,
    siblings: HashMap<String, i32>,
    last_reset: Option<Instant>,
    reset_window: Duration,
    priority_tx: watch::Sender<i32>,
    announce_tx: mpsc::UnboundedSender<PresenceEvent>,
}

impl ArbiterCore {
    fn new(
        resource: &str,
        reset_window: Duration,
        priority_tx: watch::Sender<i32>,
        announce_tx: mpsc::UnboundedSender<PresenceEvent>,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            priority: 0,
            siblings: HashMap::new(),
            last_reset: None,
            reset_window,
            priority_tx,
            announce_tx,
        }
    }

    fn set_priority(&mut self, priority: i32) {
        if priority == self.priority {
            return;
        }
        debug!(resource = %self.resource, from = self.priority, to = priority, "Priority changed");
        self.priority = priority;
        let _ = self.priority_tx.send(priority);
        self.announce();
    }

    fn announce(&self) {
        let _ = self.announce_tx.send(PresenceEvent {
            resource: self.resource.clone(),
            priority: self.priority,
        });
    }

    /// Announce ourselves; with no siblings in view, take tier 1.
    fn start(&mut self) {
        self.announce();
        if self.siblings.is_empty() && self.priority == 0 {
            self.set_priority(1);
        }
    }

    fn in_reset_window(&self) -> bool {
        self.last_reset
            .map(|at| at.elapsed() < self.reset_window)
            .unwrap_or(false)
    }

    /// Recompute our tier from the sorted resource ids of everyone in
    /// view. Distinct ids give distinct ranks, so siblings running the
    /// same computation land on distinct tiers.
    fn reset(&mut self) -> Option<Followup> {
        let mut ids: Vec<&str> = self.siblings.keys().map(String::as_str).collect();
        ids.push(&self.resource);
        ids.sort_unstable();
        // Safe: we just pushed our own id.
        let rank = ids.iter().position(|id| *id == self.resource).unwrap_or(0);
        let tier = 1 + rank as i32;

        self.last_reset = Some(Instant::now());
        self.set_priority(tier);

        if tier == 1 && !self.siblings.is_empty() {
            Some(Followup::ScheduleMasterClaim)
        } else {
            None
        }
    }

    fn on_presence(&mut self, event: PresenceEvent) -> Option<Followup> {
        if event.resource == self.resource {
            return None;
        }

        if event.priority < 0 {
            if self.siblings.remove(&event.resource).is_some() {
                info!(resource = %event.resource, "Sibling departed");
                return self.reset();
            }
            return None;
        }

        let known = self.siblings.insert(event.resource.clone(), event.priority);
        match known {
            None => {
                info!(resource = %event.resource, priority = event.priority, "Sibling appeared");
                // The newcomer needs our current priority to rank itself.
                self.announce();
                self.reset()
            }
            Some(_) => {
                // Two instances on the same tier: everyone recomputes, even
                // when the tie is between two siblings. Suppressed while a
                // reset just happened and announcements are still settling.
                if self.priority < 0 || self.in_reset_window() {
                    return None;
                }
                let tied_with_self = event.priority == self.priority;
                let tied_with_sibling = self
                    .siblings
                    .iter()
                    .any(|(id, p)| *id != event.resource && *p == event.priority);
                if tied_with_self || tied_with_sibling {
                    debug!(resource = %event.resource, priority = event.priority, "Priority conflict");
                    self.reset()
                } else {
                    None
                }
            }
        }
    }

    /// Promote to the master slot above every tier.
    fn try_claim_master(&mut self) -> Result<Followup> {
        let top = self.siblings.len() as i32 + 2;
        if let Some((holder, priority)) = self.siblings.iter().find(|(_, p)| **p >= top) {
            warn!(holder = %holder, priority, "Master slot already taken");
            return Err(Error::Exhausted(format!(
                "slot {top} held by {holder}"
            )));
        }
        info!(priority = top, "Claiming master slot");
        self.set_priority(top);
        Ok(Followup::ScheduleStepdown)
    }

    /// Post-claim check: if a sibling reached our level, yield and
    /// recompute.
    fn stepdown_check(&mut self) -> Option<Followup> {
        if self.priority > 0 && self.siblings.values().any(|p| *p >= self.priority) {
            info!(priority = self.priority, "Competing master claim, stepping down");
            return self.reset();
        }
        None
    }

    /// Steady-state rotation: the tier-1 instance re-asserts mastership.
    fn on_drift_tick(&mut self) -> Option<Followup> {
        if self.priority == 1 && !self.siblings.is_empty() {
            match self.try_claim_master() {
                Ok(followup) => Some(followup),
                Err(_) => None,
            }
        } else {
            None
        }
    }

    fn set_overloaded(&mut self, overloaded: bool) -> Option<Followup> {
        if overloaded {
            if self.priority != -1 {
                info!("Overloaded, withdrawing from arbitration");
                self.set_priority(-1);
            }
            None
        } else if self.priority == -1 {
            info!("Load cleared, rejoining arbitration");
            self.set_priority(0);
            self.reset()
        } else {
            None
        }
    }
}

/// Task wrapper driving an [`ArbiterCore`] from presence events, the
/// flow-control watch and the drift timer.
pub struct PriorityArbiter {
    core: ArbiterCore,
    settings: ArbiterSettings,
    events_tx: mpsc::Sender<PresenceEvent>,
    events_rx: mpsc::Receiver<PresenceEvent>,
    announce_rx: Option<mpsc::UnboundedReceiver<PresenceEvent>>,
    priority_rx: watch::Receiver<i32>,
    overload_rx: watch::Receiver<FlowSignal>,
    cancel: CancellationToken,
}

impl PriorityArbiter {
    pub fn new(
        resource: &str,
        settings: ArbiterSettings,
        overload_rx: watch::Receiver<FlowSignal>,
        cancel: CancellationToken,
    ) -> Self {
        let (priority_tx, priority_rx) = watch::channel(0);
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(256);
        let core = ArbiterCore::new(resource, settings.drift_interval / 2, priority_tx, announce_tx);
        Self {
            core,
            settings,
            events_tx,
            events_rx,
            announce_rx: Some(announce_rx),
            priority_rx,
            overload_rx,
            cancel,
        }
    }

    /// Sender for inbound presence events decoded off the bus
    pub fn event_sender(&self) -> mpsc::Sender<PresenceEvent> {
        self.events_tx.clone()
    }

    /// Watch over our own current priority
    pub fn priority_watch(&self) -> watch::Receiver<i32> {
        self.priority_rx.clone()
    }

    /// Outbound announcements to publish on the bus. Can be taken once.
    pub fn take_announcements(&mut self) -> Option<mpsc::UnboundedReceiver<PresenceEvent>> {
        self.announce_rx.take()
    }

    pub async fn run(mut self) {
        let far_future = || tokio::time::Instant::now() + Duration::from_secs(86_400);
        let mut claim_at: Option<tokio::time::Instant> = None;
        let mut stepdown_at: Option<tokio::time::Instant> = None;
        let mut overload_open = true;

        let mut drift = tokio::time::interval(self.settings.drift_interval);
        drift.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it before starting.
        drift.tick().await;

        self.core.start();

        loop {
            let followup = tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = self.events_rx.recv() => match event {
                    Some(event) => self.core.on_presence(event),
                    None => break,
                },

                changed = self.overload_rx.changed(), if overload_open => {
                    match changed {
                        Ok(()) => {
                            let overloaded = *self.overload_rx.borrow_and_update() == FlowSignal::Paused;
                            self.core.set_overloaded(overloaded)
                        }
                        Err(_) => {
                            overload_open = false;
                            None
                        }
                    }
                },

                _ = drift.tick() => self.core.on_drift_tick(),

                _ = tokio::time::sleep_until(claim_at.unwrap_or_else(far_future)), if claim_at.is_some() => {
                    claim_at = None;
                    match self.core.try_claim_master() {
                        Ok(followup) => Some(followup),
                        Err(_) => None,
                    }
                },

                _ = tokio::time::sleep_until(stepdown_at.unwrap_or_else(far_future)), if stepdown_at.is_some() => {
                    stepdown_at = None;
                    self.core.stepdown_check()
                },
            };

            match followup {
                Some(Followup::ScheduleMasterClaim) => {
                    claim_at = Some(tokio::time::Instant::now() + self.settings.master_delay);
                }
                Some(Followup::ScheduleStepdown) => {
                    stepdown_at = Some(tokio::time::Instant::now() + self.settings.stepdown_delay);
                }
                None => {}
            }
        }

        // Tell siblings we are gone so they re-rank without us.
        self.core.set_priority(-1);
        debug!("Arbiter stopped");
    }
}

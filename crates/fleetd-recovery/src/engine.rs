// ABOUTME: HealthEngine, which tracks per-device Health State and drives automatic recovery.
// ABOUTME: Each device owns a staleness task and at most one pending retry task, both cancelled on unregister.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use fleetd_core::AuditSink;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::config::RecoveryConfig;
use crate::device::{CommandDispatcher, DeviceHandle};
use crate::error::RecoveryError;
use crate::event::HealthEvent;
use crate::state::{
    CustomState, DeviceCommand, HealthPhase, HealthState, StateValidationError, StatusDelta,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine handle. Cheap to clone; all clones share the same device map.
#[derive(Clone)]
pub struct HealthEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: RecoveryConfig,
    dispatcher: Arc<dyn CommandDispatcher>,
    audit: Arc<dyn AuditSink>,
    devices: Mutex<HashMap<String, DeviceSlot>>,
    event_tx: broadcast::Sender<HealthEvent>,
}

struct DeviceSlot {
    state: HealthState,
    handle: Arc<dyn DeviceHandle>,
    /// Monotonic twin of `state.last_seen`, used for staleness.
    last_seen_at: Instant,
    /// Set while an attempt is reserved or running.
    in_flight: bool,
    /// Bumped whenever a pending retry is superseded.
    retry_token: u64,
    staleness_task: JoinHandle<()>,
    retry_task: Option<JoinHandle<()>>,
}

impl DeviceSlot {
    fn cancel_retry(&mut self) {
        self.retry_token = self.retry_token.wrapping_add(1);
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }
}

impl Drop for DeviceSlot {
    fn drop(&mut self) {
        self.staleness_task.abort();
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }
}

impl HealthEngine {
    pub fn new(
        config: RecoveryConfig,
        dispatcher: Arc<dyn CommandDispatcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                dispatcher,
                audit,
                devices: Mutex::new(HashMap::new()),
                event_tx,
            }),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Start tracking a device: fresh Health State plus a staleness task.
    /// Registering an id that is already tracked only swaps its handle.
    pub async fn register_device(&self, device_id: impl Into<String>, handle: Arc<dyn DeviceHandle>) {
        let device_id = device_id.into();
        let mut devices = self.inner.devices.lock().await;

        if let Some(slot) = devices.get_mut(&device_id) {
            tracing::debug!("device {} already registered, replacing handle", device_id);
            slot.handle = handle;
            return;
        }

        let staleness_task = tokio::spawn(staleness_loop(
            Arc::downgrade(&self.inner),
            device_id.clone(),
            self.inner.config.staleness_check_interval,
        ));

        devices.insert(
            device_id.clone(),
            DeviceSlot {
                state: HealthState::new(device_id.clone()),
                handle,
                last_seen_at: Instant::now(),
                in_flight: false,
                retry_token: 0,
                staleness_task,
                retry_task: None,
            },
        );
        tracing::info!("registered device {} with recovery engine", device_id);
    }

    /// Stop tracking a device and cancel its timers. Returns whether it was
    /// registered; calling it again is harmless.
    pub async fn unregister_device(&self, device_id: &str) -> bool {
        let removed = self.inner.devices.lock().await.remove(device_id);
        match removed {
            Some(_slot) => {
                tracing::info!("unregistered device {}", device_id);
                true
            }
            None => false,
        }
    }

    /// Merge a status report and optional custom fields into the device's
    /// state. Recovery, if triggered, runs in the background.
    pub async fn update_state(
        &self,
        device_id: &str,
        status: Option<StatusDelta>,
        custom: Option<CustomState>,
    ) -> Result<HealthState, RecoveryError> {
        self.inner.apply_update(device_id, status, custom).await
    }

    /// Run one recovery attempt now and wait for it to finish. If an attempt
    /// is already running for the device, returns without starting another.
    pub async fn initiate_recovery(&self, device_id: &str) -> Result<HealthState, RecoveryError> {
        let reserved = {
            let mut devices = self.inner.devices.lock().await;
            let slot = devices
                .get_mut(device_id)
                .ok_or_else(|| RecoveryError::DeviceNotRegistered(device_id.to_string()))?;
            if slot.in_flight {
                false
            } else {
                slot.in_flight = true;
                true
            }
        };

        if reserved {
            Arc::clone(&self.inner).recover(device_id.to_string()).await;
        } else {
            tracing::debug!("recovery already in flight for {}", device_id);
        }

        self.health(device_id)
            .await
            .ok_or_else(|| RecoveryError::DeviceNotRegistered(device_id.to_string()))
    }

    /// Remember the last command sent to a device so recovery can replay it.
    pub async fn record_command(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<(), RecoveryError> {
        let mut devices = self.inner.devices.lock().await;
        let slot = devices
            .get_mut(device_id)
            .ok_or_else(|| RecoveryError::DeviceNotRegistered(device_id.to_string()))?;
        slot.state.last_command = Some(command);
        slot.state.last_command_time = Some(Utc::now());
        Ok(())
    }

    /// Clear a finished incident: attempts go back to zero and any pending
    /// retry is dropped, so the next trigger starts a fresh budget.
    pub async fn reset_recovery(&self, device_id: &str) -> Result<HealthState, RecoveryError> {
        let state = {
            let mut devices = self.inner.devices.lock().await;
            let slot = devices
                .get_mut(device_id)
                .ok_or_else(|| RecoveryError::DeviceNotRegistered(device_id.to_string()))?;
            slot.cancel_retry();
            slot.state.recovery_attempts = 0;
            if slot.state.phase == HealthPhase::Failed {
                slot.state.phase = HealthPhase::Suspect;
            }
            slot.state.clone()
        };

        tracing::info!("recovery budget reset for {}", device_id);
        self.inner.audit_record("recovery_reset", device_id, json!({}));
        Ok(state)
    }

    pub async fn health(&self, device_id: &str) -> Option<HealthState> {
        self.inner
            .devices
            .lock()
            .await
            .get(device_id)
            .map(|slot| slot.state.clone())
    }

    /// Registered ids in ascending order.
    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.devices.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Unregister every device, cancelling all timers.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, DeviceSlot)> = self.inner.devices.lock().await.drain().collect();
        tracing::info!("recovery engine stopped ({} devices)", drained.len());
    }
}

impl Inner {
    fn emit(&self, event: HealthEvent) {
        let _ = self.event_tx.send(event);
    }

    fn audit_record(&self, operation: &str, device_id: &str, metadata: serde_json::Value) {
        if let Err(e) = self.audit.record(operation, device_id, Some(metadata)) {
            tracing::warn!("audit sink failed to record {} on {}: {}", operation, device_id, e);
        }
    }

    fn audit_error(&self, message: &str, error: &RecoveryError, device_id: &str) {
        let metadata = json!({ "device_id": device_id });
        if let Err(e) = self
            .audit
            .record_error(message, &error.to_string(), Some(metadata))
        {
            tracing::warn!("audit sink failed to record error for {}: {}", device_id, e);
        }
    }

    async fn apply_update(
        self: &Arc<Self>,
        device_id: &str,
        status: Option<StatusDelta>,
        custom: Option<CustomState>,
    ) -> Result<HealthState, RecoveryError> {
        let mut devices = self.devices.lock().await;
        let slot = devices
            .get_mut(device_id)
            .ok_or_else(|| RecoveryError::DeviceNotRegistered(device_id.to_string()))?;
        let (state, start_recovery) = self.merge_report(device_id, slot, status, custom);
        drop(devices);

        if start_recovery {
            tokio::spawn(Arc::clone(self).recover(device_id.to_string()));
        }

        Ok(state)
    }

    /// Fold one report into a slot the caller holds the lock for. Returns the
    /// new state and whether the caller must spawn a recovery attempt.
    fn merge_report(
        &self,
        device_id: &str,
        slot: &mut DeviceSlot,
        status: Option<StatusDelta>,
        custom: Option<CustomState>,
    ) -> (HealthState, bool) {
        let was_connected = slot.state.connected;
        let had_error = slot.state.error.is_some();
        let phase_before = slot.state.phase;

        if let Some(status) = &status {
            slot.state.connected = status.connected;
            slot.state.error = status.error.clone();
        }
        if let Some(custom) = custom {
            slot.state.custom_state.extend(custom);
        }
        slot.state.last_seen = Some(Utc::now());
        slot.last_seen_at = Instant::now();

        let validation = slot.state.validate_report(status.as_ref());
        let trigger = match &validation {
            Err(e) => Some(e.to_string()),
            Ok(()) if was_connected && !slot.state.connected => Some("disconnected".to_string()),
            Ok(()) => match (&slot.state.error, had_error) {
                (Some(error), false) => Some(format!("error reported: {}", error)),
                _ => None,
            },
        };
        if let Err(StateValidationError::NullCustomField(_)) = validation {
            slot.state.custom_state.retain(|_, value| !value.is_null());
        }

        let mut start_recovery = false;
        if let Some(reason) = &trigger {
            if phase_before == HealthPhase::Failed {
                tracing::debug!("{} on {} ignored, recovery already failed", reason, device_id);
            } else if slot.in_flight || slot.retry_task.is_some() {
                tracing::debug!("{} on {} while recovery is pending", reason, device_id);
            } else {
                tracing::info!("recovery triggered for {}: {}", device_id, reason);
                slot.state.phase = HealthPhase::Suspect;
                slot.in_flight = true;
                start_recovery = true;
            }
        } else if slot.state.connected
            && slot.state.error.is_none()
            && phase_before != HealthPhase::Recovering
        {
            if !slot.in_flight && slot.retry_task.is_some() {
                tracing::info!("{} reported healthy, dropping scheduled retry", device_id);
                slot.cancel_retry();
            }
            slot.state.phase = HealthPhase::Healthy;
        }

        let state = slot.state.clone();
        self.emit(HealthEvent::StateChanged {
            device_id: device_id.to_string(),
            state: state.clone(),
        });
        (state, start_recovery)
    }

    /// Synthesize a timeout disconnect for a connected device that has gone
    /// silent. The silence check and the synthetic report share one lock
    /// hold, so a report queued behind the check always lands after it.
    /// Returns false once the device is no longer registered.
    async fn check_staleness(self: &Arc<Self>, device_id: &str) -> bool {
        let mut devices = self.devices.lock().await;
        let Some(slot) = devices.get_mut(device_id) else {
            return false;
        };
        if !slot.state.connected
            || slot.in_flight
            || slot.last_seen_at.elapsed() <= self.config.staleness_threshold
        {
            return true;
        }

        tracing::warn!(
            "device {} silent for more than {:?}, marking disconnected",
            device_id,
            self.config.staleness_threshold
        );
        let (_, start_recovery) = self.merge_report(
            device_id,
            slot,
            Some(StatusDelta::disconnected("timeout")),
            None,
        );
        drop(devices);

        if start_recovery {
            tokio::spawn(Arc::clone(self).recover(device_id.to_string()));
        }
        true
    }

    /// One recovery attempt for a device whose `in_flight` flag the caller
    /// has already set. Boxed because a failed attempt schedules a retry
    /// task that calls back into this function.
    fn recover(self: Arc<Self>, device_id: String) -> BoxFuture<'static, ()> {
        async move {
            let (handle, attempt, last_command) = {
                let mut devices = self.devices.lock().await;
                let Some(slot) = devices.get_mut(&device_id) else {
                    return;
                };
                slot.cancel_retry();

                if slot.state.recovery_attempts >= self.config.max_attempts {
                    slot.in_flight = false;
                    slot.state.phase = HealthPhase::Failed;
                    let attempts = slot.state.recovery_attempts;
                    drop(devices);
                    tracing::error!(
                        "recovery budget exhausted for {} after {} attempts",
                        device_id,
                        attempts
                    );
                    self.audit_record("recovery_failed", &device_id, json!({ "attempts": attempts }));
                    self.emit(HealthEvent::RecoveryFailed {
                        device_id,
                        attempts,
                    });
                    return;
                }

                slot.state.recovery_attempts += 1;
                slot.state.last_recovery_time = Some(Utc::now());
                slot.state.phase = HealthPhase::Recovering;
                (
                    Arc::clone(&slot.handle),
                    slot.state.recovery_attempts,
                    slot.state.last_command.clone(),
                )
            };

            tracing::info!("starting recovery attempt {} for {}", attempt, device_id);
            self.audit_record("recovery_started", &device_id, json!({ "attempt": attempt }));
            self.emit(HealthEvent::RecoveryStarted {
                device_id: device_id.clone(),
                attempt,
            });

            let timeout = self.config.recovery_timeout;
            let outcome = tokio::time::timeout(
                timeout,
                self.perform_state_recovery(&device_id, handle.as_ref(), last_command),
            )
            .await
            .unwrap_or(Err(RecoveryError::TimedOut(timeout)));

            self.finish_attempt(device_id, outcome).await;
        }
        .boxed()
    }

    async fn finish_attempt(self: Arc<Self>, device_id: String, outcome: Result<(), RecoveryError>) {
        let mut devices = self.devices.lock().await;
        let Some(slot) = devices.get_mut(&device_id) else {
            tracing::debug!("device {} unregistered during recovery", device_id);
            return;
        };
        slot.in_flight = false;

        match outcome {
            Ok(()) => {
                slot.state.recovery_attempts = 0;
                slot.state.connected = true;
                slot.state.error = None;
                slot.state.last_seen = Some(Utc::now());
                slot.last_seen_at = Instant::now();
                slot.state.phase = HealthPhase::Healthy;
                let state = slot.state.clone();
                drop(devices);

                tracing::info!("recovery completed for {}", device_id);
                self.audit_record("recovery_completed", &device_id, json!({}));
                self.emit(HealthEvent::RecoveryCompleted {
                    device_id: device_id.clone(),
                });
                self.emit(HealthEvent::StateChanged { device_id, state });
            }
            Err(err) => {
                slot.state.connected = false;
                slot.state.error = Some(err.to_string());
                let attempts = slot.state.recovery_attempts;

                if attempts >= self.config.max_attempts {
                    slot.state.phase = HealthPhase::Failed;
                    drop(devices);

                    tracing::error!(
                        "recovery failed for {} after {} attempts: {}",
                        device_id,
                        attempts,
                        err
                    );
                    self.audit_error("recovery failed", &err, &device_id);
                    self.emit(HealthEvent::RecoveryFailed {
                        device_id,
                        attempts,
                    });
                } else {
                    slot.state.phase = HealthPhase::Suspect;
                    let delay = self.config.backoff_delay(attempts);
                    slot.cancel_retry();
                    let token = slot.retry_token;
                    slot.retry_task = Some(tokio::spawn(retry_after(
                        Arc::clone(&self),
                        device_id.clone(),
                        token,
                        delay,
                    )));
                    drop(devices);

                    tracing::warn!(
                        "recovery attempt {} for {} failed: {}; retrying in {:?}",
                        attempts,
                        device_id,
                        err,
                        delay
                    );
                    self.audit_error("recovery attempt failed", &err, &device_id);
                }
            }
        }
    }

    /// Clear queued commands, cycle the connection, re-validate, and replay
    /// the last command. The first failing step aborts the attempt.
    async fn perform_state_recovery(
        &self,
        device_id: &str,
        handle: &dyn DeviceHandle,
        last_command: Option<DeviceCommand>,
    ) -> Result<(), RecoveryError> {
        self.dispatcher
            .clear_queue(device_id)
            .await
            .map_err(RecoveryError::Dispatcher)?;
        handle.disconnect().await.map_err(RecoveryError::Handle)?;
        tokio::time::sleep(self.config.settle_interval).await;
        handle.connect().await.map_err(RecoveryError::Handle)?;

        self.revalidate(device_id).await?;

        if let Some(command) = last_command {
            tracing::debug!("replaying {} on {}", command.name, device_id);
            self.dispatcher
                .send_command(device_id, &command)
                .await
                .map_err(RecoveryError::Dispatcher)?;
        }
        Ok(())
    }

    async fn revalidate(&self, device_id: &str) -> Result<(), RecoveryError> {
        let mut candidate = self
            .devices
            .lock()
            .await
            .get(device_id)
            .map(|slot| slot.state.clone())
            .ok_or_else(|| RecoveryError::DeviceNotRegistered(device_id.to_string()))?;
        candidate.connected = true;
        candidate.last_seen = Some(Utc::now());
        candidate.validate()?;
        Ok(())
    }
}

async fn retry_after(inner: Arc<Inner>, device_id: String, token: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    {
        let mut devices = inner.devices.lock().await;
        let Some(slot) = devices.get_mut(&device_id) else {
            return;
        };
        if slot.retry_token != token || slot.in_flight {
            return;
        }
        // Detach rather than abort: this task is the one running.
        slot.retry_task.take();
        slot.in_flight = true;
    }
    inner.recover(device_id).await;
}

async fn staleness_loop(inner: Weak<Inner>, device_id: String, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.check_staleness(&device_id).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use async_trait::async_trait;
    use fleetd_core::MemoryAuditSink;

    struct Quiet;

    #[async_trait]
    impl CommandDispatcher for Quiet {
        async fn clear_queue(&self, _device_id: &str) -> Result<(), DeviceError> {
            Ok(())
        }

        async fn send_command(
            &self,
            _device_id: &str,
            _command: &DeviceCommand,
        ) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl DeviceHandle for Quiet {
        async fn connect(&self) -> Result<(), DeviceError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn engine() -> HealthEngine {
        let config = RecoveryConfig {
            staleness_check_interval: Duration::from_secs(3600),
            ..RecoveryConfig::default()
        };
        HealthEngine::new(config, Arc::new(Quiet), Arc::new(MemoryAuditSink::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn report_queued_behind_staleness_check_wins() {
        let engine = engine();
        engine.register_device("d1", Arc::new(Quiet)).await;
        engine
            .update_state("d1", Some(StatusDelta::connected()), None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        // Queue the staleness check first and a fresh report second.
        let guard = engine.inner.devices.lock().await;
        let check = tokio::spawn({
            let inner = Arc::clone(&engine.inner);
            async move { inner.check_staleness("d1").await }
        });
        tokio::task::yield_now().await;
        let report = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .update_state("d1", Some(StatusDelta::connected()), None)
                    .await
            }
        });
        tokio::task::yield_now().await;
        drop(guard);

        assert!(check.await.unwrap());
        report.await.unwrap().unwrap();

        let state = engine.health("d1").await.unwrap();
        assert!(state.connected);
        assert_eq!(state.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_report_defers_staleness() {
        let engine = engine();
        let mut events = engine.subscribe();
        engine.register_device("d1", Arc::new(Quiet)).await;
        engine
            .update_state("d1", Some(StatusDelta::connected()), None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        engine
            .update_state("d1", Some(StatusDelta::connected()), None)
            .await
            .unwrap();
        while events.try_recv().is_ok() {}

        assert!(engine.inner.check_staleness("d1").await);

        assert!(events.try_recv().is_err());
        assert!(engine.health("d1").await.unwrap().connected);
        assert!(!engine.inner.check_staleness("gone").await);
    }
}

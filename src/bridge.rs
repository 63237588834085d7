// ABOUTME: Stdin bridge for the watch command: JSON-lines device reports in, recovery engine updates out.
// ABOUTME: Also provides the tracing-only dispatcher and device handle used when no hardware driver is attached.

use async_trait::async_trait;
use fleetd_recovery::{
    CommandDispatcher, CustomState, DeviceCommand, DeviceError, DeviceHandle, HealthEngine,
    RecoveryError, StatusDelta,
};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// One line of bridge input. A line carrying only `command` records it for
/// replay; anything else is applied as a status report.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceReport {
    pub device_id: String,
    #[serde(default)]
    pub status: Option<StatusDelta>,
    #[serde(default)]
    pub custom: Option<CustomState>,
    #[serde(default)]
    pub command: Option<DeviceCommand>,
}

/// Counters reported when the input ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub applied: usize,
    pub skipped: usize,
}

/// Feed reports from `input` into `engine` until EOF. Malformed lines and
/// reports for unregistered devices are logged and skipped.
pub async fn run_bridge<R>(engine: &HealthEngine, input: R) -> std::io::Result<BridgeStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = BridgeStats::default();
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let report: DeviceReport = match serde_json::from_str(&line) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("skipping malformed report: {}", e);
                stats.skipped += 1;
                continue;
            }
        };

        match apply_report(engine, report).await {
            Ok(()) => stats.applied += 1,
            Err(e) => {
                tracing::warn!("skipping report: {}", e);
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

async fn apply_report(engine: &HealthEngine, report: DeviceReport) -> Result<(), RecoveryError> {
    let DeviceReport {
        device_id,
        status,
        custom,
        command,
    } = report;

    let command_only = command.is_some() && status.is_none() && custom.is_none();
    if let Some(command) = command {
        engine.record_command(&device_id, command).await?;
    }
    if !command_only {
        engine.update_state(&device_id, status, custom).await?;
    }
    Ok(())
}

/// Dispatcher that only logs. Stands in for a transport-specific driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatcher;

#[async_trait]
impl CommandDispatcher for TracingDispatcher {
    async fn clear_queue(&self, device_id: &str) -> Result<(), DeviceError> {
        tracing::info!("clearing command queue for {}", device_id);
        Ok(())
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<(), DeviceError> {
        tracing::info!("sending {} to {} ({})", command.name, device_id, command.payload);
        Ok(())
    }
}

/// Device handle that only logs connection changes.
#[derive(Debug, Clone)]
pub struct TracingHandle {
    device_id: String,
}

impl TracingHandle {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

#[async_trait]
impl DeviceHandle for TracingHandle {
    async fn connect(&self) -> Result<(), DeviceError> {
        tracing::info!("connecting {}", self.device_id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        tracing::info!("disconnecting {}", self.device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_core::NoopAuditSink;
    use fleetd_recovery::{HealthPhase, RecoveryConfig};
    use std::sync::Arc;

    fn engine() -> HealthEngine {
        HealthEngine::new(
            RecoveryConfig::default(),
            Arc::new(TracingDispatcher),
            Arc::new(NoopAuditSink),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_applies_reports_and_skips_bad_lines() {
        let engine = engine();
        engine
            .register_device("d1", Arc::new(TracingHandle::new("d1")))
            .await;

        let input = concat!(
            r#"{"device_id":"d1","status":{"connected":true},"custom":{"battery":90}}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"device_id":"d1","command":{"name":"beep","payload":{"count":1}}}"#,
            "\n",
            r#"{"device_id":"ghost","status":{"connected":true}}"#,
            "\n",
        );

        let stats = run_bridge(&engine, input.as_bytes()).await.unwrap();

        assert_eq!(
            stats,
            BridgeStats {
                applied: 2,
                skipped: 2
            }
        );
        let state = engine.health("d1").await.unwrap();
        assert!(state.connected);
        assert_eq!(state.phase, HealthPhase::Healthy);
        assert_eq!(state.custom_state["battery"], 90);
        assert_eq!(state.last_command.unwrap().name, "beep");
    }
}

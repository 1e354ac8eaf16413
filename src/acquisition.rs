//! Acquisition lifecycle: start, background polling, stop.
//!
//! Each device channel has at most one polling task. The task repeatedly
//! reads the timer and histogram, publishes them to the client that started
//! the run, sleeps, and ends the run once two consecutive timer reads agree
//! (the device timer reached its programmed value and stopped counting).
//!
//! # Cancellation
//!
//! Tasks are never aborted. Each one watches a [`PollSignal`] channel and
//! checks it between iterations and while sleeping:
//!
//! - `Stop` ends the run normally: the task sends timer-mode 0, marks the
//!   channel inactive and publishes the new state.
//! - `Supersede` is sent by `start` when replacing a task. The old task exits
//!   silently so it cannot stop the run that replaces it.
//!
//! `start` and `stop` are serialized by the poller table's async lock; the
//! state table is a short-lived lock shared with the tasks.

use crate::device::{DeviceSession, TimerMode};
use crate::error::{BridgeError, BridgeResult};
use crate::gateway::hub::Outbox;
use crate::gateway::messages::Response;
use crate::protocol::{validate_channel, TimerReading};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default interval between polls in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

const CHANNELS: usize = 2;

/// Acquisition state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionState {
    /// No run in progress.
    #[default]
    Inactive,
    /// Polling task running.
    Active,
    /// Stop requested; the polling task will finish at its next check.
    Stopping,
}

/// Instruction to a polling task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSignal {
    /// Keep polling.
    Run,
    /// End the run and stop the device timer.
    Stop,
    /// Exit without touching the device; a new run is taking over.
    Supersede,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollExit {
    Converged,
    Stopped,
    Superseded,
}

struct Poller {
    signal: watch::Sender<PollSignal>,
    handle: JoinHandle<()>,
}

/// Starts, monitors and stops acquisition runs.
pub struct AcquisitionController {
    device: Arc<DeviceSession>,
    poll_interval: Duration,
    pollers: tokio::sync::Mutex<[Option<Poller>; CHANNELS]>,
    states: Arc<Mutex<[AcquisitionState; CHANNELS]>>,
}

impl AcquisitionController {
    /// A controller with both channels inactive.
    pub fn new(device: Arc<DeviceSession>, poll_interval: Duration) -> Self {
        Self {
            device,
            poll_interval,
            pollers: tokio::sync::Mutex::new([None, None]),
            states: Arc::new(Mutex::new([AcquisitionState::Inactive; CHANNELS])),
        }
    }

    /// Current state of `channel`.
    pub fn state(&self, channel: i64) -> AcquisitionState {
        self.states.lock()[usize::from(validate_channel(channel))]
    }

    /// Start a run on `channel`, publishing progress to `outbox`.
    ///
    /// Any existing task for the channel is superseded and awaited first. The
    /// `active` state is published before the first poll so the client sees
    /// it ahead of any histogram.
    ///
    /// Fails with [`BridgeError::NotConnected`] and changes nothing when no
    /// device is connected.
    pub async fn start(&self, channel: i64, outbox: Outbox) -> BridgeResult<AcquisitionState> {
        let channel = validate_channel(channel);
        let slot = usize::from(channel);
        let mut pollers = self.pollers.lock().await;

        if !self.device.is_connected().await {
            return Err(BridgeError::NotConnected);
        }

        if let Some(previous) = pollers[slot].take() {
            let _ = previous.signal.send(PollSignal::Supersede);
            if let Err(e) = previous.handle.await {
                tracing::warn!(channel, "Previous acquisition task failed: {}", e);
            }
        }

        self.device.set_timer_mode(channel, TimerMode::Running).await?;
        self.states.lock()[slot] = AcquisitionState::Active;
        let _ = outbox.send(Response::acquisition_state(
            "set_acquisition_state",
            AcquisitionState::Active,
        ));

        let (signal, signal_rx) = watch::channel(PollSignal::Run);
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.device),
            channel,
            self.poll_interval,
            signal_rx,
            outbox,
            Arc::clone(&self.states),
        ));
        pollers[slot] = Some(Poller { signal, handle });

        tracing::info!(channel, interval_ms = self.poll_interval.as_millis() as u64, "Acquisition started");
        Ok(AcquisitionState::Active)
    }

    /// Stop the run on `channel`.
    ///
    /// With a live task this only signals it and returns `Stopping`; the task
    /// stops the device timer itself. Without one, timer-mode 0 is sent
    /// directly.
    pub async fn stop(&self, channel: i64) -> BridgeResult<AcquisitionState> {
        let channel = validate_channel(channel);
        let slot = usize::from(channel);
        let pollers = self.pollers.lock().await;

        if let Some(poller) = pollers[slot].as_ref() {
            if !poller.handle.is_finished() && poller.signal.send(PollSignal::Stop).is_ok() {
                let mut states = self.states.lock();
                if states[slot] == AcquisitionState::Active {
                    states[slot] = AcquisitionState::Stopping;
                }
                tracing::info!(channel, "Acquisition stop requested");
                return Ok(states[slot]);
            }
        }

        if !self.device.is_connected().await {
            return Err(BridgeError::NotConnected);
        }
        self.device.set_timer_mode(channel, TimerMode::Stopped).await?;
        self.states.lock()[slot] = AcquisitionState::Inactive;
        tracing::info!(channel, "Acquisition stopped");
        Ok(AcquisitionState::Inactive)
    }

    /// End every task without touching the device, e.g. after a disconnect.
    pub async fn abandon_all(&self) {
        let mut pollers = self.pollers.lock().await;
        for (slot, poller) in pollers.iter_mut().enumerate() {
            if let Some(poller) = poller.take() {
                let _ = poller.signal.send(PollSignal::Supersede);
                if let Err(e) = poller.handle.await {
                    tracing::warn!(channel = slot, "Acquisition task failed: {}", e);
                }
            }
            self.states.lock()[slot] = AcquisitionState::Inactive;
        }
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        for poller in self.pollers.get_mut().iter().flatten() {
            let _ = poller.signal.send(PollSignal::Supersede);
        }
    }
}

/// Read the timer and histogram of `channel` and publish them, followed by
/// every defined ROI.
pub async fn publish_histogram(
    device: &DeviceSession,
    channel: u8,
    outbox: &Outbox,
) -> BridgeResult<TimerReading> {
    let timer = device.read_timer(channel).await?;
    let histogram = device.read_histogram(channel).await?;

    let _ = outbox.send(Response::histogram(timer, &histogram));
    for report in device.roi_reports() {
        let _ = outbox.send(Response::roi("get_roi_data", &report));
    }
    Ok(timer)
}

async fn poll_loop(
    device: Arc<DeviceSession>,
    channel: u8,
    interval: Duration,
    mut signal: watch::Receiver<PollSignal>,
    outbox: Outbox,
    states: Arc<Mutex<[AcquisitionState; CHANNELS]>>,
) {
    let mut previous: Option<u64> = None;

    let exit = loop {
        let current = *signal.borrow_and_update();
        match current {
            PollSignal::Run => {}
            PollSignal::Stop => break PollExit::Stopped,
            PollSignal::Supersede => break PollExit::Superseded,
        }

        let converged = match publish_histogram(&device, channel, &outbox).await {
            Ok(timer) => {
                let same = previous == Some(timer.ticks);
                previous = Some(timer.ticks);
                same
            }
            Err(e) => {
                tracing::warn!(channel, "Acquisition poll failed, retrying: {}", e);
                previous = None;
                false
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = signal.changed() => {
                // Controller gone
                if changed.is_err() {
                    break PollExit::Superseded;
                }
            }
        }

        if converged {
            break PollExit::Converged;
        }
    };

    tracing::debug!(channel, ?exit, "Acquisition task exiting");
    if exit == PollExit::Superseded {
        return;
    }

    if let Err(e) = device.set_timer_mode(channel, TimerMode::Stopped).await {
        tracing::warn!(channel, "Failed to stop device timer: {}", e);
    }
    states.lock()[usize::from(channel)] = AcquisitionState::Inactive;
    let _ = outbox.send(Response::acquisition_state(
        "set_acquisition_state",
        AcquisitionState::Inactive,
    ));
    tracing::info!(channel, converged = exit == PollExit::Converged, "Acquisition finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MockInstrument, MockInstrumentHandle, TimerScript};
    use crate::protocol::CommandCode;
    use tokio::sync::mpsc;

    const INTERVAL: Duration = Duration::from_millis(10);

    async fn connected(script: TimerScript) -> (MockInstrumentHandle, Arc<DeviceSession>) {
        let mock = MockInstrument::new()
            .with_timer_script(script)
            .spawn()
            .await
            .unwrap();
        let device = Arc::new(DeviceSession::default());
        device.connect("127.0.0.1", mock.port()).await.unwrap();
        (mock, device)
    }

    async fn wait_for_stop_writes(mock: &MockInstrumentHandle, writes: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while mock.timer_mode_writes().len() < writes {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn equal_timer_reads_end_the_run() {
        let (mock, device) = connected(TimerScript::Sequence(vec![5, 5])).await;
        let controller = AcquisitionController::new(device, INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(controller.start(0, tx).await.unwrap(), AcquisitionState::Active);
        wait_for_stop_writes(&mock, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(mock.count(CommandCode::ReadTimer), 2);
        assert_eq!(mock.timer_mode_writes(), vec![1, 0]);
        assert_eq!(controller.state(0), AcquisitionState::Inactive);

        let mut commands = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            commands.push(msg.command.unwrap_or_default());
        }
        assert_eq!(
            commands,
            vec![
                "set_acquisition_state",
                "get_histogram_data",
                "get_histogram_data",
                "set_acquisition_state"
            ]
        );
    }

    #[tokio::test]
    async fn changing_timer_keeps_polling() {
        let (mock, device) = connected(TimerScript::Sequence(vec![5, 6, 6])).await;
        let controller = AcquisitionController::new(device, INTERVAL);
        let (tx, _rx) = mpsc::unbounded_channel();

        controller.start(0, tx).await.unwrap();
        wait_for_stop_writes(&mock, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(mock.count(CommandCode::ReadTimer), 3);
        assert_eq!(mock.timer_mode_writes(), vec![1, 0]);
    }

    #[tokio::test]
    async fn stop_signals_the_running_task() {
        let (mock, device) = connected(TimerScript::Clock).await;
        let controller = AcquisitionController::new(device, INTERVAL);
        let (tx, _rx) = mpsc::unbounded_channel();

        controller.start(1, tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(controller.stop(1).await.unwrap(), AcquisitionState::Stopping);

        wait_for_stop_writes(&mock, 2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(controller.state(1), AcquisitionState::Inactive);
        assert_eq!(mock.timer_mode_writes(), vec![1, 0]);
        assert!(mock
            .commands()
            .iter()
            .filter(|c| c.code == CommandCode::SetTimerMode)
            .all(|c| c.channel == 1));
    }

    #[tokio::test]
    async fn stop_without_task_sends_stop_directly() {
        let (mock, device) = connected(TimerScript::Sequence(vec![0])).await;
        let controller = AcquisitionController::new(device, INTERVAL);

        assert_eq!(controller.stop(0).await.unwrap(), AcquisitionState::Inactive);
        wait_for_stop_writes(&mock, 1).await;
        assert_eq!(mock.timer_mode_writes(), vec![0]);
    }

    #[tokio::test]
    async fn restart_supersedes_without_stopping() {
        let (mock, device) = connected(TimerScript::Clock).await;
        let controller = AcquisitionController::new(device, INTERVAL);
        let (tx, _rx) = mpsc::unbounded_channel();

        controller.start(0, tx.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        controller.start(0, tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The replaced task must not have stopped the new run
        assert_eq!(mock.timer_mode_writes(), vec![1, 1]);
        assert_eq!(controller.state(0), AcquisitionState::Active);
        controller.abandon_all().await;
        assert_eq!(controller.state(0), AcquisitionState::Inactive);
    }

    #[tokio::test]
    async fn start_and_stop_without_device_do_nothing() {
        let controller = AcquisitionController::new(Arc::new(DeviceSession::default()), INTERVAL);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(matches!(controller.start(0, tx).await, Err(BridgeError::NotConnected)));
        assert!(matches!(controller.stop(0).await, Err(BridgeError::NotConnected)));
        assert_eq!(controller.state(0), AcquisitionState::Inactive);
    }
}

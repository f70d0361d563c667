use crate::websocket::{EventStatus, FileStatusEvent, StatusPublisher};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Fastest and slowest pacing for interpolated 1 % steps.
const MIN_STEP: Duration = Duration::from_millis(50);
const MAX_STEP: Duration = Duration::from_millis(500);

/// Pacing when no estimate was supplied with the target.
const DEFAULT_STEP: Duration = Duration::from_millis(150);

/// Catch-up pacing once the job has finished and the bar must reach its
/// final value. Cosmetic; tune here.
const FAST_DRAIN_STEP: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
struct Target {
	progress: u8,
	status: EventStatus,
	message: String,
	eta_millis: Option<u64>,
	terminal: bool,
}

/// Per-job progress interpolator.
///
/// Workers hand in sparse, bursty targets; a background task advances an
/// internal counter toward the latest target one percent at a time and
/// publishes each advance, so subscribers see a dense, strictly monotone
/// stream. Targets are latest-wins: a lower target than the current value
/// simply pauses the stream (no regression is ever emitted).
///
/// The task never outlives the job: `finish` drains and joins it, and
/// dropping the tracker aborts it.
pub struct ProgressTracker {
	tx: watch::Sender<Target>,
	agent: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProgressTracker {
	pub fn new(file_id: impl Into<String>, publisher: StatusPublisher) -> Self {
		let (tx, rx) = watch::channel(Target {
			progress: 0,
			status: EventStatus::Processing,
			message: String::new(),
			eta_millis: None,
			terminal: false,
		});
		let agent = tokio::spawn(interpolate(file_id.into(), publisher, rx));
		Self {
			tx,
			agent: std::sync::Mutex::new(Some(agent)),
		}
	}

	/// Declare a new target. Never blocks; callable from blocking worker
	/// threads.
	pub fn set_target(&self, progress: u8, message: impl Into<String>, eta_millis: Option<u64>) {
		let _ = self.tx.send(Target {
			progress: progress.min(100),
			status: EventStatus::Processing,
			message: message.into(),
			eta_millis,
			terminal: false,
		});
	}

	/// Emit the terminal event and wait for the agent to wind down. The
	/// agent fast-drains any remaining distance first, so the terminal
	/// event is guaranteed to be the last one published for this run.
	pub async fn finish(&self, status: EventStatus, progress: u8, message: impl Into<String>) {
		let _ = self.tx.send(Target {
			progress: progress.min(100),
			status,
			message: message.into(),
			eta_millis: None,
			terminal: true,
		});
		let agent = self.agent.lock().ok().and_then(|mut guard| guard.take());
		if let Some(agent) = agent {
			let _ = agent.await;
		}
	}
}

impl Drop for ProgressTracker {
	fn drop(&mut self) {
		if let Some(agent) = self.agent.lock().ok().and_then(|mut guard| guard.take()) {
			agent.abort();
		}
	}
}

async fn interpolate(file_id: String, publisher: StatusPublisher, mut rx: watch::Receiver<Target>) {
	let mut current: u8 = 0;
	let mut last_emitted: Option<(u8, EventStatus)> = None;

	loop {
		let target = rx.borrow_and_update().clone();

		if current < target.progress {
			current += 1;
			let tick = (current, EventStatus::Processing);
			if last_emitted != Some(tick) {
				publisher.publish(FileStatusEvent::new(&file_id, EventStatus::Processing, current, target.message.clone()));
				last_emitted = Some(tick);
			}
			let step = if target.terminal { FAST_DRAIN_STEP } else { step_delay(&target, current) };
			tokio::time::sleep(step).await;
			continue;
		}

		if target.terminal {
			publisher.publish(FileStatusEvent::new(&file_id, target.status, target.progress, target.message.clone()));
			debug!("progress agent for {file_id} finished at {}", target.progress);
			return;
		}

		// Caught up; park until the worker declares a new target.
		if rx.changed().await.is_err() {
			return;
		}
	}
}

fn step_delay(target: &Target, current: u8) -> Duration {
	match target.eta_millis {
		Some(eta) => {
			let remaining = target.progress.saturating_sub(current).max(1) as u64;
			Duration::from_millis(eta / remaining).clamp(MIN_STEP, MAX_STEP)
		}
		None => DEFAULT_STEP,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::websocket::{BroadcastHub, WsEvent};
	use tokio::sync::mpsc;
	use tokio::task::JoinHandle;

	// Sessions drain concurrently so the bounded per-session queue never
	// overflows while a test is still running the tracker.
	fn collect(mut receiver: mpsc::Receiver<WsEvent>) -> JoinHandle<Vec<(EventStatus, u8)>> {
		tokio::spawn(async move {
			let mut events = Vec::new();
			while let Some(event) = receiver.recv().await {
				if let WsEvent::FileStatus { status, progress, .. } = event {
					events.push((status, progress));
				}
			}
			events
		})
	}

	async fn settle(hub: &BroadcastHub, collector: JoinHandle<Vec<(EventStatus, u8)>>) -> Vec<(EventStatus, u8)> {
		tokio::time::sleep(Duration::from_millis(20)).await;
		hub.detach("observer");
		collector.await.unwrap()
	}

	#[tokio::test(start_paused = true)]
	async fn flapping_targets_produce_a_monotone_stream() {
		let hub = BroadcastHub::new();
		let collector = collect(hub.attach("observer"));
		let publisher = hub.start();

		let tracker = ProgressTracker::new("f", publisher);
		for (target, pause) in [(5u8, 400u64), (40, 2_000), (30, 500), (70, 2_000), (100, 1_000)] {
			tracker.set_target(target, "处理中", Some(200));
			tokio::time::sleep(Duration::from_millis(pause)).await;
		}
		tracker.finish(EventStatus::Completed, 100, "转写完成").await;

		let events = settle(&hub, collector).await;
		assert!(!events.is_empty());

		// Strictly monotone progress through the processing ticks, despite
		// the 40 -> 30 flap.
		let processing: Vec<u8> = events
			.iter()
			.filter(|(status, _)| *status == EventStatus::Processing)
			.map(|(_, p)| *p)
			.collect();
		assert!(processing.windows(2).all(|w| w[0] < w[1]), "regression in {processing:?}");

		// Exactly one terminal event, last, at 100.
		let terminals: Vec<&(EventStatus, u8)> = events.iter().filter(|(status, _)| status.is_terminal()).collect();
		assert_eq!(terminals, [&(EventStatus::Completed, 100)]);
		assert_eq!(events.last(), Some(&(EventStatus::Completed, 100)));
	}

	#[tokio::test(start_paused = true)]
	async fn finish_drains_the_remaining_distance() {
		let hub = BroadcastHub::new();
		let collector = collect(hub.attach("observer"));
		let publisher = hub.start();

		let tracker = ProgressTracker::new("f", publisher);
		// Finish while far behind: drain mode must still walk up to 100.
		tracker.finish(EventStatus::Completed, 100, "done").await;

		let events = settle(&hub, collector).await;
		assert_eq!(events.last(), Some(&(EventStatus::Completed, 100)));
		assert!(events.iter().any(|(status, p)| *status == EventStatus::Processing && *p == 99));
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_emits_a_single_reset_event() {
		let hub = BroadcastHub::new();
		let collector = collect(hub.attach("observer"));
		let publisher = hub.start();

		let tracker = ProgressTracker::new("f", publisher);
		tracker.set_target(50, "处理中", Some(100));
		tokio::time::sleep(Duration::from_millis(800)).await;

		tracker.finish(EventStatus::Uploaded, 0, "转写已停止").await;

		let events = settle(&hub, collector).await;
		assert_eq!(events.last(), Some(&(EventStatus::Uploaded, 0)));
		assert_eq!(events.iter().filter(|(status, _)| *status == EventStatus::Uploaded).count(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn repeated_targets_do_not_repeat_ticks() {
		let hub = BroadcastHub::new();
		let collector = collect(hub.attach("observer"));
		let publisher = hub.start();

		let tracker = ProgressTracker::new("f", publisher);
		tracker.set_target(10, "a", Some(100));
		tokio::time::sleep(Duration::from_millis(3_000)).await;
		tracker.set_target(10, "b", Some(100));
		tokio::time::sleep(Duration::from_millis(3_000)).await;
		tracker.finish(EventStatus::Completed, 100, "done").await;

		let events = settle(&hub, collector).await;
		let mut seen = std::collections::HashSet::new();
		for tick in &events {
			assert!(seen.insert(*tick), "duplicate emission {tick:?}");
		}
	}

	#[test]
	fn step_delay_is_clamped() {
		let target = |eta| Target {
			progress: 100,
			status: EventStatus::Processing,
			message: String::new(),
			eta_millis: eta,
			terminal: false,
		};
		assert_eq!(step_delay(&target(Some(1)), 99), MIN_STEP);
		assert_eq!(step_delay(&target(Some(1_000_000)), 99), MAX_STEP);
		assert_eq!(step_delay(&target(None), 0), DEFAULT_STEP);
		// 10s spread over the remaining 50 steps: 200ms each.
		assert_eq!(step_delay(&target(Some(10_000)), 50), Duration::from_millis(200));
	}
}

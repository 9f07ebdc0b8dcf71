use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use crossbeam::channel::unbounded;
use log::{debug, warn};
use tokio::time::sleep;

mod clock;
mod config;
mod drift;
mod events;
mod playback;
mod util;

pub use clock::*;
pub use config::*;
pub use drift::*;
pub use events::*;
pub use playback::*;
pub use util::*;

/// A type passed to the components of a session, to access configuration and
/// emit events.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Config,

    event_sender: EventSender,
}

impl EngineContext {
    pub fn emit(&self, event: SyncEvent) {
        self.event_sender.send(event).expect("event is sent");
    }
}

/// The participant side of the engine, assembled.
///
/// Keeps a clock estimate fresh against a [TimeSource], mirrors the
/// coordinator's commands at the right local instants, and watches the
/// player's reported position for drift. The player layer drives it with
/// received commands and position reports, and reacts to the events it
/// emits.
pub struct SyncSession<T> {
    context: EngineContext,
    synchronizer: ClockSynchronizer<T>,
    estimate: AtomicCell<ClockEstimate>,
    mirror: Arc<CommandMirror>,
    monitor: DriftMonitor,

    event_receiver: EventReceiver,
}

impl<T> SyncSession<T>
where
    T: TimeSource,
{
    pub fn new(config: Config, source: Arc<T>) -> SyncSession<T> {
        let (event_sender, event_receiver) = unbounded();

        let context = EngineContext {
            config: config.clone(),
            event_sender,
        };

        SyncSession {
            synchronizer: ClockSynchronizer::new(config.clone(), source),
            estimate: AtomicCell::new(ClockEstimate::default()),
            mirror: Arc::new(CommandMirror::new()),
            monitor: DriftMonitor::new(&config),
            context,
            event_receiver,
        }
    }

    /// Runs a sampling round against the reference clock and replaces the
    /// session's estimate in one step.
    pub async fn sync_clock(&self) -> Result<ClockEstimate, ClockError> {
        let estimate = self.synchronizer.sync().await?;

        self.estimate.store(estimate);
        self.context.emit(SyncEvent::ClockSynced { estimate });

        Ok(estimate)
    }

    /// The current clock estimate. Unsynced until the first sync run
    /// finishes, commands still execute with zero assumed offset.
    pub fn estimate(&self) -> ClockEstimate {
        self.estimate.load()
    }

    /// The current reference time, by the session's best estimate.
    pub fn reference_now_ms(&self) -> i64 {
        self.estimate.load().reference_time_ms(local_now_ms())
    }

    /// Handles a command received from the coordinator.
    ///
    /// Stale commands are dropped, due ones execute right away, future ones
    /// are scheduled at their translated local deadline.
    pub fn receive(&self, command: SyncCommand) {
        match self.mirror.admit(&command, &self.estimate.load()) {
            Admittance::Stale => {
                debug!("Discarding stale command {:?}", command);
            }
            Admittance::Immediate => {
                execute(&self.mirror, &self.context, command);
            }
            Admittance::At { local_deadline_ms } => {
                let mirror = self.mirror.clone();
                let context = self.context.clone();

                get_or_create_handle().spawn(async move {
                    let wait_ms = (local_deadline_ms - local_now_ms()).max(0);

                    sleep(Duration::from_millis(wait_ms as u64)).await;
                    execute(&mirror, &context, command);
                });
            }
        }
    }

    /// Reports where the player actually is, feeding the drift monitor.
    ///
    /// Returns the recorded sample, or None while no anchor is mirrored yet.
    /// A warranted correction is emitted as [SyncEvent::CorrectionRequired].
    pub fn report_position(&self, reported_media_time_ms: f64) -> Option<DriftSample> {
        let anchor = self.mirror.anchor()?;

        let observation =
            self.monitor
                .observe(reported_media_time_ms, self.reference_now_ms(), &anchor);

        if let Some(intent) = observation.intent {
            self.context.emit(SyncEvent::CorrectionRequired { intent });
        }

        Some(observation.sample)
    }

    /// The mirrored anchor, if a snapshot has arrived yet.
    pub fn anchor(&self) -> Option<PlaybackAnchor> {
        self.mirror.anchor()
    }

    /// Where the media should be right now, derived from the mirrored anchor.
    pub fn expected_media_time_ms(&self) -> Option<f64> {
        let anchor = self.mirror.anchor()?;

        Some(anchor.expected_media_time_ms(self.reference_now_ms()))
    }

    /// Receive events from the session.
    pub fn wait_for_event(&self) -> SyncEvent {
        self.event_receiver
            .recv()
            .expect("event is received without error")
    }
}

/// Applies a command to the mirror and publishes the anchor it produced.
fn execute(mirror: &CommandMirror, context: &EngineContext, command: SyncCommand) {
    // A higher-sequence command may have fired while this one waited.
    if let Some(anchor) = mirror.execute(command) {
        context.emit(SyncEvent::AnchorApplied { anchor });
    }
}

#[derive(Debug)]
pub struct SyncSessionIntrospection {
    pub estimate: ClockEstimate,
    pub mirror: CommandMirrorIntrospection,
    pub monitor: DriftMonitorIntrospection,
}

impl<T> Introspect<SyncSessionIntrospection> for SyncSession<T>
where
    T: TimeSource,
{
    fn introspect(&self) -> SyncSessionIntrospection {
        SyncSessionIntrospection {
            estimate: self.estimate.load(),
            mirror: self.mirror.introspect(),
            monitor: self.monitor.introspect(),
        }
    }
}

/// Spawns a task that re-syncs the session's clock at the configured
/// interval, so the estimate tracks clock skew over a long viewing session.
/// The task ends when the session is dropped.
pub fn spawn_resync_task<T>(session: &Arc<SyncSession<T>>)
where
    T: TimeSource,
{
    let interval = session.context.config.resync_interval();
    let weak = Arc::downgrade(session);

    get_or_create_handle().spawn(async move {
        loop {
            sleep(interval).await;

            let Some(session) = weak.upgrade() else {
                break;
            };

            if let Err(err) = session.sync_clock().await {
                warn!("Periodic clock resync failed: {}", err);
            }
        }
    });
}

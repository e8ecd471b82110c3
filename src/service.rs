use std::{future::Future, io, sync::Arc, time::Duration};

use rumqttc::{LastWill, QoS};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    discovery_entries, slugify, Command, CommandFamily, CommandRegistry, CommandRunner, Executor,
    Identity, InboundMessage, MessageBus, MessageHandler, SessionEvent,
};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// Cadence of the `online` status heartbeat.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(30);
/// Upper bound for the final `offline` publish on shutdown.
pub const SHUTDOWN_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Retained `offline` on the availability topic, registered with the broker at connect time.
pub fn availability_last_will(identity: &Identity) -> LastWill {
    LastWill::new(
        identity.availability_topic(),
        OFFLINE,
        QoS::AtLeastOnce,
        true,
    )
}

/// Publish every discovery document, then mark the instance online.
/// Failures are logged and do not stop the remaining publishes.
pub async fn announce<B: MessageBus>(
    bus: &B,
    identity: &Identity,
    registries: &[CommandRegistry],
) {
    for entry in discovery_entries(identity, registries) {
        if let Err(err) = bus
            .publish_discovery(
                entry.component,
                identity.unique_id(),
                &entry.object_id,
                &entry.document,
            )
            .await
        {
            log::error!(
                "Failed to publish discovery message for {}: {err}",
                entry.document.name
            );
        }
    }

    publish_availability(bus, identity, ONLINE).await;
}

pub async fn publish_availability<B: MessageBus>(bus: &B, identity: &Identity, value: &str) {
    if let Err(err) = bus
        .publish(
            &identity.availability_topic(),
            QoS::AtLeastOnce,
            true,
            value.into(),
        )
        .await
    {
        log::error!("Failed to publish availability {value}: {err}");
    }
}

/// Handler that executes `command` each time a message arrives. The payload is ignored.
pub fn command_handler<R>(
    family: CommandFamily,
    command: Command,
    executor: Arc<Executor<R>>,
) -> MessageHandler
where
    R: CommandRunner + 'static,
{
    Arc::new(move |message: InboundMessage| {
        log::info!("Received {family} command {} on {}", command.name, message.topic);
        match executor.execute(command.action) {
            Ok(()) => log::info!("Executed {family} command {}", command.name),
            Err(err) => log::error!("Failed to execute {family} command {}: {err}", command.name),
        }
    })
}

/// Subscribe to the command topic of every entry in `registry`.
/// Returns how many subscriptions succeeded; failures are logged per command.
pub async fn subscribe_family<B, R>(
    bus: &B,
    identity: &Identity,
    registry: &CommandRegistry,
    executor: Arc<Executor<R>>,
) -> usize
where
    B: MessageBus,
    R: CommandRunner + 'static,
{
    let family = registry.family();
    let mut subscribed = 0;
    for command in registry.iter() {
        let handler = command_handler(family, command.clone(), Arc::clone(&executor));
        let topic = identity.command_topic(family, &slugify(command.name));
        match bus.subscribe(&topic, QoS::AtLeastOnce, handler).await {
            Ok(()) => subscribed += 1,
            Err(err) => log::error!(
                "Failed to subscribe to {family} command {}: {err}",
                command.name
            ),
        }
    }
    subscribed
}

/// Publish `online` to the status topic every `period` until `cancel` fires.
/// The first beat goes out one period after start.
pub fn spawn_heartbeat<B>(
    bus: Arc<B>,
    topic: String,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    B: MessageBus + 'static,
{
    tokio::task::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = bus
                        .publish(&topic, QoS::AtLeastOnce, false, ONLINE.into())
                        .await
                    {
                        log::error!("Failed to publish status: {err}");
                    }
                }
            }
        }
        log::debug!("Status heartbeat stopped");
    })
}

/// Re-announce availability after every automatic reconnect, since the broker may have
/// published our last will in between.
pub fn spawn_reconnect_watcher<B>(
    bus: Arc<B>,
    identity: Identity,
    mut events: broadcast::Receiver<SessionEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    B: MessageBus + 'static,
{
    tokio::task::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(SessionEvent::Connected { reconnect: true }) => {
                    publish_availability(bus.as_ref(), &identity, ONLINE).await;
                }
                Ok(SessionEvent::ConnectionLost(reason)) => {
                    log::warn!("Connection lost ({reason}), waiting for reconnect");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Missed {skipped} session events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Publish the retained `offline` availability, waiting at most `SHUTDOWN_PUBLISH_TIMEOUT`.
pub async fn publish_offline<B: MessageBus>(bus: &B, identity: &Identity) {
    let publish = publish_availability(bus, identity, OFFLINE);
    if tokio::time::timeout(SHUTDOWN_PUBLISH_TIMEOUT, publish)
        .await
        .is_err()
    {
        log::error!("Timed out publishing offline status");
    }
}

/// Wait for SIGINT or, on unix, SIGTERM. An error means no signal can be observed and the
/// caller has no graceful way to stop.
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                return first_shutdown_signal(tokio::signal::ctrl_c(), Some(terminate.recv())).await
            }
            Err(err) => log::warn!("Unable to listen for SIGTERM: {err}"),
        }
    }

    first_shutdown_signal(
        tokio::signal::ctrl_c(),
        None::<std::future::Pending<Option<()>>>,
    )
    .await
}

/// Resolve on whichever of `interrupt` or `terminate` fires first.
///
/// A failing `interrupt` listener falls back to `terminate` alone; the error is returned only
/// when no listener is left. `terminate` yielding `None` means its stream closed.
pub async fn first_shutdown_signal<I, T>(interrupt: I, terminate: Option<T>) -> io::Result<()>
where
    I: Future<Output = io::Result<()>>,
    T: Future<Output = Option<()>>,
{
    let Some(terminate) = terminate else {
        return interrupt.await;
    };
    tokio::pin!(terminate);

    let interrupted = tokio::select! {
        interrupted = interrupt => interrupted,
        received = &mut terminate => return received.ok_or_else(terminate_closed),
    };
    match interrupted {
        Ok(()) => Ok(()),
        Err(err) => {
            log::warn!("Unable to listen for SIGINT: {err}");
            terminate.await.ok_or_else(terminate_closed)
        }
    }
}

fn terminate_closed() -> io::Error {
    io::Error::other("SIGTERM listener closed")
}

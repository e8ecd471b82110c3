use std::{process::ExitCode, sync::Arc};

use mqtt_commands::{
    load_dotenv, local_hostname, service, CommandRegistry, Executor, Identity, Platform,
    ServiceConfig, Session,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    if let Err(err) = load_dotenv() {
        log::error!("{err}");
        return ExitCode::FAILURE;
    }
    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::error!("Invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let identity = Identity::new(&local_hostname());
    let session = Arc::new(Session::new(
        config
            .mqtt_client_config()
            .last_will(Some(service::availability_last_will(&identity))),
    ));
    let events = session.events();

    if let Err(err) = session.connect().await {
        log::error!("{err} ({})", config.broker_url());
        return ExitCode::FAILURE;
    }

    let platform = Platform::current();
    let registries = CommandRegistry::all(platform);
    service::announce(session.as_ref(), &identity, &registries).await;

    let executor = Arc::new(Executor::system());
    for registry in &registries {
        let subscribed = service::subscribe_family(
            session.as_ref(),
            &identity,
            registry,
            Arc::clone(&executor),
        )
        .await;
        log::debug!(
            "Subscribed to {subscribed}/{} {} commands on {platform}",
            registry.len(),
            registry.family()
        );
    }

    let cancel = CancellationToken::new();
    let heartbeat = service::spawn_heartbeat(
        Arc::clone(&session),
        identity.status_topic(),
        service::STATUS_INTERVAL,
        cancel.clone(),
    );
    let watcher = service::spawn_reconnect_watcher(
        Arc::clone(&session),
        identity.clone(),
        events,
        cancel.clone(),
    );

    let signal = service::wait_for_shutdown_signal().await;
    match &signal {
        Ok(()) => log::info!("Shutting down..."),
        Err(err) => log::error!("Unable to listen for shutdown signal, stopping: {err}"),
    }

    cancel.cancel();
    for task in [heartbeat, watcher] {
        if let Err(err) = task.await {
            log::warn!("Background task ended abnormally: {err}");
        }
    }

    service::publish_offline(session.as_ref(), &identity).await;
    session.disconnect().await;
    match signal {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

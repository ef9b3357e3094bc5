use std::{process, sync::Arc};

use folio::{
    application::{convert::Converter, error::AppError, notify::NotificationQueue},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        notify::build_notifier,
        server::{Server, ShutdownSignal, TerminationSignals},
        telemetry,
        tls::{self, TrustPolicy},
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::CheckConfig(_) => run_check_config(&settings),
    }
}

/// Load the trust policy and TLS material without binding a listener.
fn run_check_config(settings: &config::Settings) -> Result<(), AppError> {
    let policy = load_trust_policy(&settings.tls)?;
    if settings.tls.enabled() {
        tls::build_server_config(&settings.tls, Arc::new(policy)).map_err(InfraError::from)?;
    }
    info!(
        addr = %settings.server.addr,
        tls = settings.tls.enabled(),
        engine = %settings.engine.path.display(),
        "configuration is valid"
    );
    Ok(())
}

fn load_trust_policy(tls_settings: &config::TlsSettings) -> Result<TrustPolicy, AppError> {
    let policy = TrustPolicy::load(
        tls_settings.root_ca.as_deref(),
        tls_settings.cert_subject.clone(),
    )
    .map_err(InfraError::from)?;

    match (policy.requires_client_certificate(), policy.required_subject()) {
        (false, _) => warn!("no root CA configured, client certificates are not requested"),
        (true, None) => info!("client certificates required, any subject accepted"),
        (true, Some(subject)) => info!(subject, "client certificates required"),
    }
    Ok(policy)
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let policy = Arc::new(load_trust_policy(&settings.tls)?);
    let tls_config = if settings.tls.enabled() {
        Some(tls::build_server_config(&settings.tls, policy).map_err(InfraError::from)?)
    } else {
        warn!("no server certificate configured, serving plain HTTP");
        None
    };

    let notifier = build_notifier(
        &settings.notifications.webhooks,
        settings.notifications.timeout,
    )?;
    let (notifications, notification_worker) = NotificationQueue::spawn(
        notifier,
        settings.notifications.queue_capacity.get() as usize,
        settings.notifications.timeout,
    );

    let converter = Converter::new(settings.engine.clone(), &settings.convert);
    let state = HttpState {
        converter: Arc::new(converter),
        notifications,
        client_ip: if settings.server.cloudflare {
            http::ClientIpSource::Cloudflare
        } else {
            http::ClientIpSource::Peer
        },
    };
    let router = http::build_router(state, settings.server.max_request_bytes.get() as usize);

    let server = Server::bind(
        settings.server.addr,
        router,
        tls_config,
        settings.server.graceful_shutdown,
    )
    .await?;

    let signals = TerminationSignals::install()?;
    let (shutdown_tx, shutdown) = ShutdownSignal::channel();
    let signals = tokio::spawn(async move {
        signals.recv().await;
        let _ = shutdown_tx.send(true);
    });

    let result = server.run(shutdown).await;
    signals.abort();

    // The router owned the last queue handles; let the worker drain.
    if tokio::time::timeout(settings.notifications.timeout, notification_worker)
        .await
        .is_err()
    {
        warn!("pending notifications were not delivered before exit");
    }

    result.map_err(AppError::from)?;
    info!("server stopped");
    Ok(())
}

mod logging;

use std::sync::Arc;

use buildrelay_core::{config::Config, env};
use buildrelay_github::{GitHost, GitHub};
use buildrelay_jobs::Worker;
use buildrelay_pubsub::{PubSubClient, Subscriber, TracingReporter};
use tokio::signal;

#[tokio::main]
async fn main() {
    let config_path = std::env::var(env::CONFIG_PATH).unwrap_or_else(|_| "config.yml".to_string());
    let config = Arc::new(Config::load(&config_path).expect("Failed to load config"));
    logging::init(config.log_format);

    let github: Option<Arc<dyn GitHost>> = if config.has_git_ops_jobs() {
        Some(GitHub::new(&config.github).await.expect("Failed to create GitHub client"))
    } else {
        None
    };
    let http = reqwest::Client::builder()
        .user_agent(concat!("buildrelay/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to create HTTP client");
    let worker = Worker::from_config(&config, github, http).expect("Failed to set up jobs");
    tracing::info!("Configured {} job(s)", worker.jobs().len());

    // Against the hosted service, a missing topic or subscription stops startup here
    let pubsub = PubSubClient::new(&config.pubsub).expect("Failed to create Pub/Sub client");
    let topic = &config.pubsub.topic;
    pubsub.topic(topic).await.expect("Failed to set up topic");
    let subscription = pubsub
        .subscription(topic, &config.pubsub.subscription)
        .await
        .expect("Failed to set up subscription");

    let span = tracing::info_span!("subscription", topic = %topic, name = %subscription.name());
    let handle = span.in_scope(|| {
        Subscriber::new(Arc::new(subscription), Arc::new(TracingReporter))
            .with_max_outstanding(config.pubsub.max_outstanding)
            .subscribe(Arc::new(worker))
    });
    tracing::info!("Listening for build events on {}", config.pubsub.subscription);

    shutdown_signal().await;
    tracing::info!("Shutting down, waiting for in-flight messages");
    if let Err(e) = handle.stop_and_wait().await {
        tracing::error!("{e:#}");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            result = signal::ctrl_c() => result.expect("Failed to listen for ctrl-c"),
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("Failed to listen for ctrl-c")
    }
}

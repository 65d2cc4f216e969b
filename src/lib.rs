pub mod config;
pub mod observer;
pub mod router;
pub mod statistics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use codec::address::{Address, Protocol};
use mesh_core::endpoint::{EndpointConfig, TcpEndpoint};
use mesh_core::events::EventPublisher;
use mesh_core::identifier::Identifier;
use mesh_core::manager::PeerManager;
use mesh_core::scheduler::{Delegate, Registrar, TaskService};
use mesh_core::tracking::TrackingService;

use self::config::Config;
use self::observer::{DispatchDelegate, Observer};
use self::router::Router;
use self::statistics::Statistics;

/// Ticks [`TrackingService::execute`] once per scheduler cycle.
struct TrackingSweep(Arc<TrackingService>);

impl Delegate for TrackingSweep {
    fn name(&self) -> &str {
        "tracking-sweep"
    }

    fn execute(&self) {
        self.0.execute();
    }
}

fn node_identifier(config: &Config) -> Identifier {
    match &config.node.identifier_seed {
        Some(seed) => Identifier::derive(seed.as_bytes()),
        None => {
            use rand::RngCore;
            let mut bytes = [0u8; mesh_core::identifier::LEN];
            rand::thread_rng().fill_bytes(&mut bytes);
            let identifier = Identifier::from_bytes(bytes);
            log::warn!("no node.identifier-seed configured, generated ephemeral identifier {identifier}");
            identifier
        }
    }
}

/// Bootstraps every service this node needs and blocks forever. Mirrors the
/// teacher's non-returning `startup()` entry point — there is no admin/API
/// surface here to otherwise keep the process alive.
pub async fn startup(config: Arc<Config>) -> Result<()> {
    let local_identifier = node_identifier(&config);
    log::info!("node identifier: {local_identifier}");

    let events = Arc::new(EventPublisher::new());
    let manager = PeerManager::new(local_identifier, events.clone());
    let tracking = Arc::new(TrackingService::new(Duration::from_millis(config.tracking.expiration_ms)));
    let statistics = Statistics::default();
    let observer = Arc::new(Observer::new(statistics.clone()));
    events.subscribe(observer);

    let router = Router::new(manager.clone(), tracking.clone(), statistics.clone());

    let mut registrar = Registrar::new();
    registrar.register(Arc::new(DispatchDelegate::new(events.clone())), &[]);
    registrar.register(Arc::new(TrackingSweep(tracking.clone())), &[]);
    registrar.register(router.clone(), &["event-dispatch"]);
    let registrar = Arc::new(parking_lot::RwLock::new(registrar));
    TaskService::new(registrar, Duration::from_millis(100)).spawn();

    let mut endpoints = Vec::new();
    for interface in &config.server.interfaces {
        let bind_address = Address::parse(Protocol::Tcp, &interface.bind).with_context(|| format!("invalid bind address {}", interface.bind))?;

        let endpoint_config = EndpointConfig {
            connect_timeout: Duration::from_secs(config.connect.timeout_secs),
            retry_interval: Duration::from_secs(config.connect.retry_interval_secs),
            retry_limit: config.connect.retry_limit,
            idle_timeout: interface.idle_timeout(),
        };

        let endpoint = TcpEndpoint::new(bind_address.clone(), local_identifier, manager.clone(), events.clone(), endpoint_config);

        let listening = endpoint.clone();
        tokio::spawn(async move {
            if listening.listen().await.is_err() {
                log::error!("endpoint {} stopped listening", listening.bind_address());
            }
        });

        endpoints.push(endpoint);
    }

    if config.server.interfaces.is_empty() {
        log::warn!("no interfaces are bound, this node can only dial out, not accept connections");
    }

    if let Some(primary) = endpoints.first().cloned() {
        for peer in &config.connect.peers {
            let address = Address::parse(Protocol::Tcp, &peer.address).with_context(|| format!("invalid peer address {}", peer.address))?;
            let identifier = peer
                .identifier
                .as_deref()
                .map(|external| Identifier::parse_external(external).with_context(|| format!("invalid peer identifier {external}")))
                .transpose()?;

            let primary = primary.clone();
            tokio::spawn(async move {
                if let Err(rejection) = primary.connect(address.clone(), identifier, None).await {
                    log::warn!("connect to {address} rejected: {rejection:?}");
                }
            });
        }
    } else if !config.connect.peers.is_empty() {
        log::warn!("peers are configured to dial but no interface is bound to dial from");
    }

    events.publish(mesh_core::events::Event::RuntimeStarted);

    std::future::pending::<()>().await;
    Ok(())
}

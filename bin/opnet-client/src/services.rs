//! Service spawning and wiring.

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use opnet_authority::{AuthorityKeySet, AuthorityManager, TrustedEntity, TrustedKey};
use opnet_btcio::L1Client;
use opnet_common::TaskExecutor;
use opnet_db::NodeDatabase;
use opnet_p2p::{
    BlacklistConfig, PeerId, PeerManager, PeerManagerConfig, StreamConfig, StreamManager,
};
use opnet_plugin::{
    PluginDirWatcher, PluginManager, PluginManagerConfig, ThreadWorkerSpawner, DEBOUNCE_WINDOW,
};
use opnet_primitives::{sha256, Params};
use opnet_status::StatusChannel;
use opnet_sync::{PipelineOutcome, SyncConfig, SyncContext, SyncPipeline};
use opnet_ws::{build_registry, SubscriptionManager, WsServer, WsServerConfig};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::info;

use crate::{
    config::ClientConfig,
    dev_crypto::{dev_sign, DevAuthenticator, DevPluginVerifier, DevSignatureVerifier, DevTxVerifier},
    indexer::{indexer_task, IndexerCtx},
    rpc,
    transport::{listener_task, TcpTransport},
};

/// Builds the regtest trusted-authority set: a deterministic three-entity
/// arrangement every dev node can reproduce.
fn dev_authority_set(params: &Params) -> anyhow::Result<AuthorityKeySet> {
    let entity = |name: &str, tags: &[u8]| TrustedEntity {
        name: name.to_string(),
        keys: tags
            .iter()
            .map(|tag| {
                let public_key = vec![*tag; 16];
                let opnet_key = vec![tag.wrapping_add(0x40); 16];
                let self_signature = dev_sign(&opnet_key, &public_key);
                TrustedKey {
                    public_key,
                    opnet_key,
                    self_signature,
                }
            })
            .collect(),
    };

    AuthorityKeySet::load(
        params.authority_version(),
        params.chain_id(),
        params.network(),
        vec![
            entity("alpha", &[0x01, 0x02]),
            entity("beta", &[0x03, 0x04]),
            entity("gamma", &[0x05]),
        ],
        &DevSignatureVerifier,
        params.min_trusted_keys(),
    )
    .context("loading trusted authority set")
}

/// Wires and spawns every subsystem, then runs the IBD pipeline and hands
/// off to the steady-state indexer.
pub(crate) async fn start_services<C, D>(
    config: ClientConfig,
    client: Arc<C>,
    db: Arc<D>,
    executor: TaskExecutor,
) -> anyhow::Result<()>
where
    C: L1Client + 'static,
    D: NodeDatabase + 'static,
{
    let params = Arc::new(config.make_params());
    let status = StatusChannel::new();
    let cancel = executor.shutdown_token();

    let authority = Arc::new(AuthorityManager::new(
        dev_authority_set(&params)?,
        Arc::new(DevSignatureVerifier),
        params.max_keys_per_entity(),
        params.min_trusted_keys(),
        params.min_entities(),
    ));

    // P2P.
    let local_identity = sha256(format!("opnet-node:{}", config.client.p2p_port).as_bytes());
    let transport = TcpTransport::new(local_identity);
    let (streams, deliver_rx) = StreamManager::new(transport.clone(), StreamConfig::default());
    let (peer_manager, p2p_handle, events_tx) = PeerManager::new(
        streams,
        deliver_rx,
        db.clone(),
        authority.clone(),
        Arc::new(DevAuthenticator::new(
            local_identity.as_ref().to_vec(),
            &params,
        )),
        Arc::new(DevTxVerifier),
        params.clone(),
        PeerManagerConfig::default(),
        BlacklistConfig::default(),
    );
    for (i, addr) in config.client.bootstrap_peers.iter().enumerate() {
        // Bootstrap peers are identified by their address until identify.
        let peer = PeerId::new(sha256(format!("bootstrap:{i}:{addr}").as_bytes()));
        transport.add_peer(peer, addr.clone());
    }
    executor.spawn_with_shutdown(peer_manager.run(cancel.clone()));

    let p2p_listener = TcpListener::bind((
        config.client.p2p_host.as_str(),
        config.client.p2p_port,
    ))
    .await
    .context("binding p2p listener")?;
    executor.spawn_with_shutdown(listener_task(p2p_listener, events_tx, cancel.clone()));

    // Plugins.
    let mut plugin_manager = PluginManager::new(
        PluginManagerConfig {
            plugins_dir: config.plugins.dir.clone(),
            network: params.network().to_string(),
            chain_id: params.chain_id(),
            reindex_from_block: config.plugins.reindex_from_block,
        },
        Arc::new(ThreadWorkerSpawner::noop()),
        Arc::new(DevPluginVerifier),
    );
    // A plugin refusing its reindex step aborts node startup.
    plugin_manager.startup().await.context("plugin startup")?;
    let plugins = Arc::new(Mutex::new(plugin_manager));

    if config.plugins.dir.exists() {
        let (watcher, mut watch_events) =
            PluginDirWatcher::start(&config.plugins.dir, DEBOUNCE_WINDOW)
                .context("starting plugin watcher")?;
        let watch_plugins = plugins.clone();
        let watch_cancel = cancel.clone();
        executor.spawn_with_shutdown(async move {
            // Watcher guard lives with the task.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = watch_cancel.cancelled() => break,
                    event = watch_events.recv() => {
                        let Some(event) = event else { break };
                        watch_plugins.lock().await.handle_watch_event(event).await;
                    }
                }
            }
        });
    }

    // WebSocket API.
    let subs = Arc::new(SubscriptionManager::new());
    let registry = Arc::new(build_registry(db.clone(), status.clone(), subs.clone()));
    let mut ws_config = WsServerConfig::default();
    ws_config.session.chain_id = params.chain_id();
    let ws_server = WsServer::new(registry, subs, status.clone(), ws_config);
    let ws_listener = TcpListener::bind((config.client.ws_host.as_str(), config.client.ws_port))
        .await
        .context("binding ws listener")?;
    executor.spawn_with_shutdown(ws_server.run(ws_listener, cancel.clone()));

    // JSON-RPC.
    executor.spawn_critical(
        "json-rpc",
        rpc::spawn_rpc(
            config.client.rpc_host.clone(),
            config.client.rpc_port,
            db.clone(),
            status.clone(),
            params.clone(),
        ),
    );

    // IBD, then steady state.
    let pipeline = SyncPipeline::new(SyncContext {
        client: client.clone(),
        db: db.clone(),
        authority,
        witnesses: Arc::new(p2p_handle.clone()),
        status: status.clone(),
        params: params.clone(),
        config: SyncConfig {
            worker_count: config.sync.worker_count,
            batch_size: config.sync.batch_size,
            checkpoint_interval_blocks: config.sync.checkpoint_interval_blocks,
            checkpoint_interval: Duration::from_millis(config.sync.checkpoint_interval_ms),
            ..SyncConfig::default()
        },
    });

    let indexer_ctx = IndexerCtx {
        client,
        db,
        status,
        params,
        p2p: Some(p2p_handle),
        plugins,
        validator: None,
        poll_interval: Duration::from_secs(2),
    };
    let ibd_cancel = cancel.clone();
    executor.spawn_critical("indexer", async move {
        match pipeline.run(&ibd_cancel).await? {
            PipelineOutcome::Completed => {
                info!("IBD complete, entering steady state");
                indexer_task(indexer_ctx, ibd_cancel).await
            }
            PipelineOutcome::Aborted => {
                info!("IBD aborted by shutdown");
                Ok(())
            }
        }
    });

    Ok(())
}

//! HTTP JSON-RPC surface under `/api/v1`.

use std::sync::Arc;

use jsonrpsee::{types::ErrorObjectOwned, RpcModule};
use serde_json::json;
use tracing::info;

use opnet_db::NodeDatabase;
use opnet_primitives::Params;
use opnet_status::StatusChannel;

/// Major protocol version advertised in the `Protocol: OP_NET <major>`
/// header and the handshake.
pub(crate) const PROTOCOL_MAJOR: u32 = 1;

struct RpcCtx<D> {
    db: Arc<D>,
    status: StatusChannel,
    params: Arc<Params>,
}

fn internal_error(e: impl std::fmt::Display) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(-32603, "internal error", Some(json!({ "error": e.to_string() })))
}

fn invalid_params(msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(-32602, "invalid params", Some(json!({ "error": msg })))
}

/// Builds the JSON-RPC module and serves it until the process exits.
pub(crate) async fn spawn_rpc<D>(
    rpc_host: String,
    rpc_port: u16,
    db: Arc<D>,
    status: StatusChannel,
    params: Arc<Params>,
) -> anyhow::Result<()>
where
    D: NodeDatabase + 'static,
{
    let ctx = Arc::new(RpcCtx { db, status, params });
    let mut module = RpcModule::new(ctx);

    module.register_method("opnet_protocolVersion", |_, _, _| {
        Ok::<u32, ErrorObjectOwned>(PROTOCOL_MAJOR)
    })?;

    module.register_method("opnet_chainStatus", |_, ctx, _| {
        let chain = ctx.status.chain_status();
        Ok::<serde_json::Value, ErrorObjectOwned>(json!({
            "network": ctx.params.network().to_string(),
            "chainId": ctx.params.chain_id(),
            "tipHeight": chain.tip.map(|t| t.height()),
            "tipHash": chain.tip.map(|t| format!("{:?}", t.blkid())),
            "checksumHeight": chain.checksum_height,
            "finalizedEpoch": chain.finalized_epoch.map(|e| e.epoch()),
        }))
    })?;

    module.register_async_method("opnet_getBlockByHeight", |params, ctx, _| async move {
        let height: u64 = params.one().map_err(|_| invalid_params("expected height"))?;
        let header = ctx.db.header_at(height).await.map_err(internal_error)?;
        Ok::<serde_json::Value, ErrorObjectOwned>(
            serde_json::to_value(header).map_err(internal_error)?,
        )
    })?;

    module.register_async_method("opnet_getEpoch", |params, ctx, _| async move {
        let number: u64 = params.one().map_err(|_| invalid_params("expected epoch number"))?;
        let epoch = ctx.db.epoch(number).await.map_err(internal_error)?;
        Ok::<serde_json::Value, ErrorObjectOwned>(
            serde_json::to_value(epoch).map_err(internal_error)?,
        )
    })?;

    module.register_async_method("opnet_getBlockWitnesses", |params, ctx, _| async move {
        let height: u64 = params.one().map_err(|_| invalid_params("expected height"))?;
        let witnesses = ctx.db.witnesses_at(height).await.map_err(internal_error)?;
        Ok::<serde_json::Value, ErrorObjectOwned>(
            serde_json::to_value(witnesses).map_err(internal_error)?,
        )
    })?;

    let server = jsonrpsee::server::ServerBuilder::new()
        .build(format!("{rpc_host}:{rpc_port}"))
        .await?;
    info!(host = %rpc_host, port = rpc_port, "json-rpc listening");

    let handle = server.start(module);
    handle.stopped().await;
    Ok(())
}

//! HTTP RPC server exposing header submission, chain queries and transaction proof checks.

use std::str::FromStr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, TxMerkleNode, Txid};
use btc_relay::header::serialize_header;
use btc_relay::{BranchId, HeaderRecord, RelayConfig, RelayError, SharedRelay, SubmitOutcome};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::app::AppClient;

/// Configuration for the RPC server
#[derive(Clone)]
pub struct RpcConfig {
    /// Host and port binding for the RPC server (e.g., "127.0.0.1:5000")
    pub rpc_host: String,
}

/// HTTP RPC server for the relay
pub struct RpcServer {
    config: RpcConfig,
    app_state: AppState,
    rx_shutdown: broadcast::Receiver<()>,
}

/// Writes go through the app server, reads take a snapshot of the shared relay
#[derive(Clone)]
pub struct AppState {
    app_client: AppClient,
    relay: SharedRelay,
}

impl AppState {
    pub fn new(app_client: AppClient, relay: SharedRelay) -> Self {
        Self { app_client, relay }
    }
}

/// Status code and message returned on failure
pub type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
pub struct SubmitHeaderRequest {
    /// Hex encoded 80-byte header
    pub header: String,
    /// Whether the header is claimed to extend the main chain; no claim when absent
    pub main_chain: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitForkHeaderRequest {
    /// Hex encoded 80-byte header
    pub header: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitHeaderResponse {
    pub hash: BlockHash,
    pub height: u32,
    pub branch_id: BranchId,
    /// Decimal cumulative work
    pub chain_work: String,
    pub reorg: Option<ReorgResponse>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReorgResponse {
    pub promoted_branch: BranchId,
    pub demoted_branch: Option<BranchId>,
    pub common_ancestor: BlockHash,
    pub common_ancestor_height: u32,
    pub old_tip: BlockHash,
    pub new_tip: BlockHash,
}

impl From<SubmitOutcome> for SubmitHeaderResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        Self {
            hash: outcome.hash,
            height: outcome.height,
            branch_id: outcome.branch_id,
            chain_work: outcome.chain_work.to_string(),
            reorg: outcome.reorg.map(|reorg| ReorgResponse {
                promoted_branch: reorg.promoted_branch,
                demoted_branch: reorg.demoted_branch,
                common_ancestor: reorg.common_ancestor,
                common_ancestor_height: reorg.common_ancestor_height,
                old_tip: reorg.old_tip,
                new_tip: reorg.new_tip,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyTransactionRequest {
    pub txid: Txid,
    pub block_hash: BlockHash,
    pub tx_index: u32,
    /// Sibling hashes from the leaf level up, hex in display order
    pub merkle_path: Vec<String>,
    pub confirmations: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyTransactionResponse {
    pub block_height: u32,
    pub tx_index: u32,
    pub confirmations: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderResponse {
    pub hash: BlockHash,
    pub height: u32,
    pub branch_id: BranchId,
    /// Decimal cumulative work
    pub chain_work: String,
    /// Hex encoded 80-byte header
    pub header: String,
}

impl From<&HeaderRecord> for HeaderResponse {
    fn from(record: &HeaderRecord) -> Self {
        Self {
            hash: record.hash,
            height: record.height,
            branch_id: record.branch_id,
            chain_work: record.chain_work.to_string(),
            header: hex::encode(serialize_header(&record.header)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForkResponse {
    pub id: BranchId,
    pub anchor: BlockHash,
    pub tip: Option<BlockHash>,
    pub length: usize,
}

impl RpcServer {
    pub fn new(
        config: RpcConfig,
        app_state: AppState,
        rx_shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            app_state,
            rx_shutdown,
        }
    }

    async fn run_inner(&self) -> Result<(), std::io::Error> {
        info!("Starting RPC server on {}", self.config.rpc_host);

        let app = Router::new()
            .route("/headers", post(submit_header))
            .route("/forks", get(get_forks))
            .route("/forks/:fork_id/headers", post(submit_fork_header))
            .route("/verify", post(verify_transaction))
            .route("/head", get(get_head))
            .route("/block-header/:block_hash", get(get_block_header))
            .route("/main-chain/:block_height", get(get_main_chain_header))
            .route("/config", get(get_config))
            .with_state(self.app_state.clone())
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&self.config.rpc_host).await?;
        let mut rx_shutdown = self.rx_shutdown.resubscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { rx_shutdown.recv().await.unwrap_or_default() })
            .await
    }

    pub async fn run(&self) -> Result<(), ()> {
        match self.run_inner().await {
            Err(err) => {
                error!("RPC server exited: {}", err);
                Err(())
            }
            Ok(()) => {
                info!("RPC server terminated");
                Ok(())
            }
        }
    }
}

fn relay_error_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::BlockNotFound(_) => StatusCode::NOT_FOUND,
        RelayError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::DuplicateBlock(_) => StatusCode::CONFLICT,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn relay_error(err: RelayError) -> ApiError {
    (relay_error_status(&err), err.to_string())
}

/// Relay rejections are the caller's fault, anything else is ours
fn app_error(err: anyhow::Error) -> ApiError {
    match err.downcast_ref::<RelayError>() {
        Some(relay_err) => (relay_error_status(relay_err), relay_err.to_string()),
        None => {
            error!("Failed to process submission: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

fn decode_header(header: &str) -> Result<Vec<u8>, ApiError> {
    hex::decode(header).map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid header hex: {e}")))
}

/// Submit a raw block header
///
/// # Returns
/// * `Json<SubmitHeaderResponse>` - Where the header landed and the reorg it caused, if any
/// * `StatusCode::UNPROCESSABLE_ENTITY` - If the relay rejects the header
pub async fn submit_header(
    State(state): State<AppState>,
    Json(request): Json<SubmitHeaderRequest>,
) -> Result<Json<SubmitHeaderResponse>, ApiError> {
    let header = decode_header(&request.header)?;
    let outcome = state
        .app_client
        .submit_header(header, request.main_chain)
        .await
        .map_err(app_error)?;
    Ok(Json(outcome.into()))
}

/// Submit a raw block header extending the tip of a fork
pub async fn submit_fork_header(
    State(state): State<AppState>,
    Path(fork_id): Path<BranchId>,
    Json(request): Json<SubmitForkHeaderRequest>,
) -> Result<Json<SubmitHeaderResponse>, ApiError> {
    let header = decode_header(&request.header)?;
    let outcome = state
        .app_client
        .submit_fork_header(header, fork_id)
        .await
        .map_err(app_error)?;
    Ok(Json(outcome.into()))
}

/// Verify that a transaction is included in a sufficiently confirmed main-chain block
pub async fn verify_transaction(
    State(state): State<AppState>,
    Json(request): Json<VerifyTransactionRequest>,
) -> Result<Json<VerifyTransactionResponse>, ApiError> {
    let merkle_path = request
        .merkle_path
        .iter()
        .map(|sibling| {
            TxMerkleNode::from_str(sibling)
                .map(|node| node.to_byte_array())
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid Merkle path: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let verified = state
        .relay
        .verify_transaction(
            &request.txid,
            &request.block_hash,
            request.tx_index,
            &merkle_path,
            request.confirmations,
        )
        .map_err(relay_error)?;
    Ok(Json(VerifyTransactionResponse {
        block_height: verified.block_height,
        tx_index: verified.tx_index,
        confirmations: verified.confirmations,
    }))
}

/// Get the current main-chain tip
pub async fn get_head(State(state): State<AppState>) -> Result<Json<HeaderResponse>, ApiError> {
    let relay = state.relay.read();
    let tip = relay.tip().ok_or_else(|| relay_error(RelayError::NotInitialized))?;
    Ok(Json(tip.into()))
}

/// Get any stored block header, main chain or fork, by hash
pub async fn get_block_header(
    State(state): State<AppState>,
    Path(block_hash): Path<String>,
) -> Result<Json<HeaderResponse>, ApiError> {
    let block_hash = BlockHash::from_str(&block_hash)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid block hash: {e}")))?;
    let relay = state.relay.read();
    let record = relay
        .header_by_hash(&block_hash)
        .ok_or_else(|| relay_error(RelayError::BlockNotFound(block_hash)))?;
    Ok(Json(record.into()))
}

/// Get the main-chain block header at the given height
pub async fn get_main_chain_header(
    State(state): State<AppState>,
    Path(block_height): Path<u32>,
) -> Result<Json<HeaderResponse>, ApiError> {
    let relay = state.relay.read();
    let record = relay
        .store()
        .main_chain_at(block_height)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("No main-chain block at height {block_height}"),
            )
        })?;
    Ok(Json(record.into()))
}

/// Get the consensus parameters and reorg policy the relay validates with
pub async fn get_config(State(state): State<AppState>) -> Json<RelayConfig> {
    Json(*state.relay.read().config())
}

/// List the live forks
pub async fn get_forks(State(state): State<AppState>) -> Json<Vec<ForkResponse>> {
    let relay = state.relay.read();
    let forks = relay
        .store()
        .branches()
        .map(|branch| ForkResponse {
            id: branch.id,
            anchor: branch.anchor,
            tip: branch.tip().copied(),
            length: branch.len(),
        })
        .collect();
    Json(forks)
}

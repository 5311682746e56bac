use std::net::SocketAddr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::client::BlobResponse;
use crate::errors::{ChainError, ChainResult};
use crate::node::{NodeHandle, NodeStatus};
use crate::types::{Account, Block, BlockVote, Header, Peer, Transaction, TransactionReceipt};

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    hash: String,
}

#[derive(Serialize)]
struct AckResponse {
    accepted: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    address: String,
}

#[derive(Serialize)]
struct NonceResponse {
    address: String,
    nonce: u64,
}

#[derive(Serialize)]
struct TxStatusResponse {
    tx_id: String,
    status: Option<u16>,
}

#[derive(Deserialize)]
struct HeightQuery {
    height: u64,
}

#[derive(Deserialize)]
struct HashQuery {
    hash: String,
}

#[derive(Deserialize)]
struct AddressQuery {
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxQuery {
    tx_id: String,
}

pub fn router(node: NodeHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status/node", get(node_status))
        .route("/block/api/blockFromPeer", post(block_from_peer))
        .route("/vote/api/vote", post(vote_from_peer))
        .route("/vote/api/voteResult", post(vote_result_from_peer))
        .route("/vote/api/getVotes", get(votes))
        .route("/block/api/getHeaderByHeight", get(header_by_height))
        .route("/block/api/getBlockByHeight", get(block_by_height))
        .route("/block/api/last", get(last_header))
        .route("/db/api/getByHash", get(blob_by_hash))
        .route("/transaction/api/newTransaction", post(new_transaction))
        .route("/transaction/api/userTxs", get(user_txs))
        .route("/transaction/api/status", get(transaction_status))
        .route("/transaction/api/receipt", get(receipt))
        .route("/account/api/info", get(account_info))
        .route("/account/api/nonce", get(account_nonce))
        .route("/peer/api/peers", get(peers))
        .with_state(AppState { node })
}

pub async fn serve(node: NodeHandle, addr: SocketAddr) -> ChainResult<()> {
    let router = router(node);
    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "RPC server listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| ChainError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        address: state.node.address().to_string(),
    })
}

async fn node_status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.node.status())
}

// Peer messages are acknowledged at once and handled in the background so a
// slow replay never holds up the sender.

async fn block_from_peer(State(state): State<AppState>, Json(block): Json<Block>) -> Json<AckResponse> {
    tokio::spawn(async move {
        let height = block.header.height;
        if let Err(err) = state.node.block_from_peer(block).await {
            warn!(height, %err, "failed to process proposal");
        }
    });
    Json(AckResponse { accepted: true })
}

async fn vote_from_peer(State(state): State<AppState>, Json(vote): Json<BlockVote>) -> Json<AckResponse> {
    tokio::spawn(async move {
        if let Err(err) = state.node.vote_from_peer(vote).await {
            warn!(%err, "failed to process vote");
        }
    });
    Json(AckResponse { accepted: true })
}

async fn vote_result_from_peer(
    State(state): State<AppState>,
    Json(votes): Json<Vec<BlockVote>>,
) -> Json<AckResponse> {
    tokio::spawn(async move {
        if let Err(err) = state.node.vote_result_from_peer(votes).await {
            warn!(%err, "failed to process vote set");
        }
    });
    Json(AckResponse { accepted: true })
}

async fn votes(State(state): State<AppState>, Query(query): Query<HashQuery>) -> ApiResult<Vec<BlockVote>> {
    state.node.votes(&query.hash).map(Json).map_err(to_http_error)
}

async fn header_by_height(
    State(state): State<AppState>,
    Query(query): Query<HeightQuery>,
) -> ApiResult<Option<Header>> {
    state
        .node
        .header_by_height(query.height)
        .map(Json)
        .map_err(to_http_error)
}

async fn block_by_height(
    State(state): State<AppState>,
    Query(query): Query<HeightQuery>,
) -> ApiResult<Option<Block>> {
    state
        .node
        .block_by_height(query.height)
        .map(Json)
        .map_err(to_http_error)
}

async fn last_header(State(state): State<AppState>) -> Json<Option<Header>> {
    Json(Some(state.node.last_header()))
}

async fn blob_by_hash(
    State(state): State<AppState>,
    Query(query): Query<HashQuery>,
) -> ApiResult<Option<BlobResponse>> {
    state
        .node
        .blob(&query.hash)
        .map(|blob| {
            Json(blob.map(|bytes| BlobResponse {
                hash: query.hash.clone(),
                data: hex::encode(bytes),
            }))
        })
        .map_err(to_http_error)
}

async fn new_transaction(
    State(state): State<AppState>,
    Json(tx): Json<Transaction>,
) -> ApiResult<SubmitResponse> {
    state
        .node
        .submit_transaction(tx)
        .map(|hash| Json(SubmitResponse { hash }))
        .map_err(to_http_error)
}

async fn user_txs(State(state): State<AppState>, Query(query): Query<AddressQuery>) -> Json<Vec<Transaction>> {
    Json(state.node.user_txs(&query.address))
}

async fn transaction_status(
    State(state): State<AppState>,
    Query(query): Query<TxQuery>,
) -> ApiResult<TxStatusResponse> {
    state
        .node
        .transaction_status(&query.tx_id)
        .map(|status| {
            Json(TxStatusResponse {
                tx_id: query.tx_id.clone(),
                status,
            })
        })
        .map_err(to_http_error)
}

async fn receipt(
    State(state): State<AppState>,
    Query(query): Query<TxQuery>,
) -> ApiResult<Option<TransactionReceipt>> {
    state
        .node
        .receipt(&query.tx_id)
        .map(Json)
        .map_err(to_http_error)
}

async fn account_info(
    State(state): State<AppState>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<Option<Account>> {
    state
        .node
        .account(&query.address)
        .map(Json)
        .map_err(to_http_error)
}

async fn account_nonce(
    State(state): State<AppState>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<NonceResponse> {
    state
        .node
        .nonce(&query.address)
        .map(|nonce| {
            Json(NonceResponse {
                address: query.address.clone(),
                nonce,
            })
        })
        .map_err(to_http_error)
}

async fn peers(State(state): State<AppState>) -> Json<Vec<Peer>> {
    Json(state.node.peers())
}

fn to_http_error(err: ChainError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        ChainError::Transaction(_) => StatusCode::BAD_REQUEST,
        ChainError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

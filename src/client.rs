//! Outbound side of the peer protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{ChainError, ChainResult};
use crate::types::{BlobSource, Block, BlockVote, Header, Peer};

/// Calls a node makes on its peers.
///
/// Lookups return `Ok(None)` when the peer answered but does not have the
/// item, and `Err` when the peer could not be reached or answered garbage.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    async fn send_block(&self, peer: &Peer, block: &Block) -> ChainResult<()>;

    async fn send_vote(&self, peer: &Peer, vote: &BlockVote) -> ChainResult<()>;

    async fn send_vote_set(&self, peer: &Peer, votes: &[BlockVote]) -> ChainResult<()>;

    async fn header_by_height(&self, peer: &Peer, height: u64) -> ChainResult<Option<Header>>;

    async fn block_by_height(&self, peer: &Peer, height: u64) -> ChainResult<Option<Block>>;

    async fn last_header(&self, peer: &Peer) -> ChainResult<Option<Header>>;

    async fn votes(&self, peer: &Peer, block_hash: &str) -> ChainResult<Vec<BlockVote>>;

    async fn blob(&self, peer: &Peer, hash: &str) -> ChainResult<Option<Vec<u8>>>;
}

/// Wire form of a content-addressed blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobResponse {
    pub hash: String,
    pub data: String,
}

#[derive(Clone, Debug)]
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> ChainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(network_error)?;
        Ok(Self { client })
    }

    async fn post<T: Serialize + ?Sized + Sync>(&self, peer: &Peer, path: &str, body: &T) -> ChainResult<()> {
        let url = format!("{}{path}", peer.base_url());
        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(network_error)?;
        Ok(())
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        peer: &Peer,
        path: &str,
        query: &[(&str, String)],
    ) -> ChainResult<T> {
        let url = format!("{}{path}", peer.base_url());
        self.client
            .get(&url)
            .query(query)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(network_error)?
            .json::<T>()
            .await
            .map_err(network_error)
    }
}

fn network_error(err: reqwest::Error) -> ChainError {
    ChainError::Network(err.to_string())
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn send_block(&self, peer: &Peer, block: &Block) -> ChainResult<()> {
        self.post(peer, "/block/api/blockFromPeer", block).await
    }

    async fn send_vote(&self, peer: &Peer, vote: &BlockVote) -> ChainResult<()> {
        self.post(peer, "/vote/api/vote", vote).await
    }

    async fn send_vote_set(&self, peer: &Peer, votes: &[BlockVote]) -> ChainResult<()> {
        self.post(peer, "/vote/api/voteResult", votes).await
    }

    async fn header_by_height(&self, peer: &Peer, height: u64) -> ChainResult<Option<Header>> {
        self.get(peer, "/block/api/getHeaderByHeight", &[("height", height.to_string())])
            .await
    }

    async fn block_by_height(&self, peer: &Peer, height: u64) -> ChainResult<Option<Block>> {
        self.get(peer, "/block/api/getBlockByHeight", &[("height", height.to_string())])
            .await
    }

    async fn last_header(&self, peer: &Peer) -> ChainResult<Option<Header>> {
        self.get(peer, "/block/api/last", &[]).await
    }

    async fn votes(&self, peer: &Peer, block_hash: &str) -> ChainResult<Vec<BlockVote>> {
        self.get(peer, "/vote/api/getVotes", &[("hash", block_hash.to_string())])
            .await
    }

    async fn blob(&self, peer: &Peer, hash: &str) -> ChainResult<Option<Vec<u8>>> {
        let response: Option<BlobResponse> = self
            .get(peer, "/db/api/getByHash", &[("hash", hash.to_string())])
            .await?;
        response
            .map(|blob| {
                hex::decode(&blob.data)
                    .map_err(|err| ChainError::Network(format!("invalid blob encoding: {err}")))
            })
            .transpose()
    }
}

/// Message fanned out to the whole delegate set.
#[derive(Clone, Debug)]
pub enum Outbound {
    Block(Block),
    Vote(BlockVote),
    VoteSet(Vec<BlockVote>),
}

impl Outbound {
    fn kind(&self) -> &'static str {
        match self {
            Self::Block(_) => "block",
            Self::Vote(_) => "vote",
            Self::VoteSet(_) => "vote set",
        }
    }
}

/// Sends `message` to every peer on detached tasks; failures are only logged.
pub fn broadcast(client: Arc<dyn PeerClient>, peers: &[Peer], message: Outbound) {
    let message = Arc::new(message);
    for peer in peers {
        let client = client.clone();
        let peer = peer.clone();
        let message = message.clone();
        tokio::spawn(async move {
            let result = match message.as_ref() {
                Outbound::Block(block) => client.send_block(&peer, block).await,
                Outbound::Vote(vote) => client.send_vote(&peer, vote).await,
                Outbound::VoteSet(votes) => client.send_vote_set(&peer, votes).await,
            };
            match result {
                Ok(()) => debug!(peer = %peer.account, kind = message.kind(), "message delivered"),
                Err(err) => warn!(peer = %peer.account, kind = message.kind(), %err, "failed to deliver message"),
            }
        });
    }
}

/// Fetches content-addressed blobs from the first peer that has them.
pub struct PeerBlobSource {
    client: Arc<dyn PeerClient>,
    peers: Vec<Peer>,
}

impl PeerBlobSource {
    pub fn new(client: Arc<dyn PeerClient>, peers: Vec<Peer>) -> Self {
        Self { client, peers }
    }
}

#[async_trait]
impl BlobSource for PeerBlobSource {
    async fn fetch_blob(&self, hash: &str) -> ChainResult<Option<Vec<u8>>> {
        for peer in &self.peers {
            match self.client.blob(peer, hash).await {
                Ok(Some(bytes)) => return Ok(Some(bytes)),
                Ok(None) => continue,
                Err(err) => debug!(peer = %peer.account, %hash, %err, "blob fetch failed"),
            }
        }
        Ok(None)
    }
}

//! Application server and client serializing relay writes through async message passing.
//!
//! Every accepted header is journaled before the submitter gets its answer; reads bypass the
//! server and go straight to the shared relay.

use std::sync::Arc;

use btc_relay::{BranchId, RelayConfig, RelayError, SharedRelay, SubmitOutcome};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

use crate::journal::{GenesisRecord, HeaderJournal};

/// Request sent to the application server via the API channel
pub struct ApiRequest {
    /// The body of the API request containing the specific operation
    pub body: ApiRequestBody,
    /// Channel to send the response back to the caller
    pub tx_response: oneshot::Sender<ApiResponse>,
}

pub type ApiResponse = Result<ApiResponseBody, anyhow::Error>;

/// Possible request operations that can be sent to the application server
pub enum ApiRequestBody {
    /// Submit a raw header, optionally asserting whether it extends the main chain
    SubmitHeader {
        header: Vec<u8>,
        main_chain: Option<bool>,
    },
    /// Submit a raw header extending the tip of the given fork
    SubmitForkHeader { header: Vec<u8>, fork_id: BranchId },
}

impl ApiRequestBody {
    fn header(&self) -> &[u8] {
        match self {
            Self::SubmitHeader { header, .. } | Self::SubmitForkHeader { header, .. } => header,
        }
    }
}

/// Response body for API requests containing the result data
pub enum ApiResponseBody {
    /// Response containing where the submitted header landed
    Submitted(SubmitOutcome),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Api requests channel capacity
    pub api_requests_capacity: usize,
    /// Consensus parameters and reorg policy
    pub relay: RelayConfig,
    /// Genesis used when the journal holds none yet
    pub genesis: Option<GenesisRecord>,
}

/// The application server owning every write to the relay
pub struct AppServer {
    config: AppConfig,
    relay: SharedRelay,
    journal: Arc<dyn HeaderJournal>,
    rx_requests: mpsc::Receiver<ApiRequest>,
    rx_shutdown: broadcast::Receiver<()>,
}

/// Client for communicating with the application server via async channels
#[derive(Clone)]
pub struct AppClient {
    tx_requests: mpsc::Sender<ApiRequest>,
}

/// Wire an application server and its client together
pub fn create_app(
    config: AppConfig,
    relay: SharedRelay,
    journal: Arc<dyn HeaderJournal>,
    rx_shutdown: broadcast::Receiver<()>,
) -> (AppServer, AppClient) {
    let (tx_requests, rx_requests) = mpsc::channel(config.api_requests_capacity);
    let server = AppServer::new(config, relay, journal, rx_requests, rx_shutdown);
    (server, AppClient::new(tx_requests))
}

impl AppServer {
    pub fn new(
        config: AppConfig,
        relay: SharedRelay,
        journal: Arc<dyn HeaderJournal>,
        rx_requests: mpsc::Receiver<ApiRequest>,
        rx_shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            relay,
            journal,
            rx_requests,
            rx_shutdown,
        }
    }

    /// Initialize the relay from the journal, or from the configured genesis on first start
    async fn restore(&self) -> Result<(), anyhow::Error> {
        let (genesis, fresh) = match self.journal.load_genesis().await? {
            Some(stored) => {
                if self
                    .config
                    .genesis
                    .as_ref()
                    .is_some_and(|configured| *configured != stored)
                {
                    warn!("Configured genesis differs from the stored one, using the stored genesis");
                }
                (stored, false)
            }
            None => {
                let genesis = self.config.genesis.clone().ok_or_else(|| {
                    anyhow::anyhow!("No genesis header stored or configured")
                })?;
                (genesis, true)
            }
        };
        let headers = self.journal.load_headers().await?;

        {
            let mut relay = self.relay.write();
            relay.initialize(
                &genesis.header,
                genesis.height,
                genesis.chain_work.clone(),
                Some(genesis.epoch_start_time),
            )?;
            for (i, header) in headers.iter().enumerate() {
                relay.ingest_header(header).map_err(|err| {
                    anyhow::anyhow!("Failed to replay journaled header #{}: {}", i, err)
                })?;
            }
            if let Some(tip) = relay.tip() {
                info!(
                    "Relay restored: {} journaled headers, tip {} at height {}",
                    headers.len(),
                    tip.hash,
                    tip.height
                );
            }
        }

        if fresh {
            self.journal.save_genesis(&genesis).await?;
        }
        Ok(())
    }

    fn apply(&self, body: &ApiRequestBody) -> Result<SubmitOutcome, RelayError> {
        let mut relay = self.relay.write();
        match body {
            ApiRequestBody::SubmitHeader {
                header,
                main_chain: Some(claimed_main_chain),
            } => relay.submit_header(header, *claimed_main_chain),
            ApiRequestBody::SubmitHeader {
                header,
                main_chain: None,
            } => relay.ingest_header(header),
            ApiRequestBody::SubmitForkHeader { header, fork_id } => {
                relay.submit_fork_header(header, *fork_id)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<(), anyhow::Error> {
        info!("App server started");
        self.restore().await?;

        loop {
            tokio::select! {
                Some(req) = self.rx_requests.recv() => {
                    let res = self.apply(&req.body);
                    if let Ok(outcome) = &res {
                        // A header the journal failed to record would be lost on restart
                        self.journal.append_header(&outcome.hash, req.body.header()).await?;
                    }
                    let res = res
                        .map(ApiResponseBody::Submitted)
                        .map_err(anyhow::Error::from);
                    req.tx_response
                        .send(res)
                        .map_err(|_| anyhow::anyhow!("Failed to send response to submit request"))?;
                },
                _ = self.rx_shutdown.recv() => {
                    return Ok(())
                }
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), ()> {
        match self.run_inner().await {
            Err(err) => {
                error!("App server exited: {}", err);
                Err(())
            }
            Ok(()) => {
                info!("App server terminated");
                Ok(())
            }
        }
    }
}

impl AppClient {
    pub fn new(tx_requests: mpsc::Sender<ApiRequest>) -> Self {
        Self { tx_requests }
    }

    /// Helper method to send a request and handle the response
    async fn send_request<T>(
        &self,
        body: ApiRequestBody,
        extract_response: impl FnOnce(ApiResponseBody) -> Option<T>,
    ) -> Result<T, anyhow::Error> {
        let (tx_response, rx_response) = oneshot::channel();
        self.tx_requests
            .send(ApiRequest { body, tx_response })
            .await
            .map_err(|_| anyhow::anyhow!("App server is not running"))?;

        let res = rx_response
            .await
            .map_err(|_| anyhow::anyhow!("Failed to send request"))?;

        match res {
            Ok(response_body) => extract_response(response_body)
                .ok_or_else(|| anyhow::anyhow!("Unexpected response type")),
            Err(err) => Err(err),
        }
    }

    pub async fn submit_header(
        &self,
        header: Vec<u8>,
        main_chain: Option<bool>,
    ) -> Result<SubmitOutcome, anyhow::Error> {
        self.send_request(
            ApiRequestBody::SubmitHeader { header, main_chain },
            |response| match response {
                ApiResponseBody::Submitted(outcome) => Some(outcome),
            },
        )
        .await
    }

    pub async fn submit_fork_header(
        &self,
        header: Vec<u8>,
        fork_id: BranchId,
    ) -> Result<SubmitOutcome, anyhow::Error> {
        self.send_request(
            ApiRequestBody::SubmitForkHeader { header, fork_id },
            |response| match response {
                ApiResponseBody::Submitted(outcome) => Some(outcome),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bitcoin::block::Header as BlockHeader;
    use btc_relay::header::serialize_header;
    use btc_relay::test_utils::{child_header, genesis_header, mine_declared, regtest_params};
    use btc_relay::work::work_from_target;
    use btc_relay::{Relay, ReorgPolicy};

    use super::*;
    use crate::journal::MockHeaderJournal;

    fn relay_config() -> RelayConfig {
        RelayConfig {
            params: regtest_params(),
            policy: ReorgPolicy::CumulativeWork,
        }
    }

    fn genesis_record() -> GenesisRecord {
        let header = genesis_header();
        GenesisRecord {
            header: serialize_header(&header).to_vec(),
            height: 0,
            chain_work: work_from_target(&regtest_params().pow_limit()),
            epoch_start_time: header.time,
        }
    }

    fn app_config(genesis: Option<GenesisRecord>) -> AppConfig {
        AppConfig {
            api_requests_capacity: 16,
            relay: relay_config(),
            genesis,
        }
    }

    fn mined_chain(parent: &BlockHeader, len: usize, salt: u8) -> Vec<BlockHeader> {
        let mut headers: Vec<BlockHeader> = Vec::new();
        for _ in 0..len {
            let prev = headers.last().unwrap_or(parent);
            headers.push(mine_declared(child_header(prev, salt)));
        }
        headers
    }

    fn spawn_app(
        config: AppConfig,
        journal: MockHeaderJournal,
    ) -> (SharedRelay, AppClient, broadcast::Sender<()>) {
        let relay = SharedRelay::new(Relay::new(config.relay));
        let (tx_shutdown, rx_shutdown) = broadcast::channel(1);
        let (mut server, client) =
            create_app(config, relay.clone(), Arc::new(journal), rx_shutdown);
        tokio::spawn(async move { server.run().await });
        (relay, client, tx_shutdown)
    }

    #[tokio::test]
    async fn test_first_start_saves_genesis_and_journals_headers() {
        let journaled = Arc::new(Mutex::new(Vec::new()));
        let mut journal = MockHeaderJournal::new();
        journal.expect_load_genesis().times(1).returning(|| Ok(None));
        journal.expect_load_headers().times(1).returning(|| Ok(vec![]));
        journal
            .expect_save_genesis()
            .withf(|genesis| *genesis == genesis_record())
            .times(1)
            .returning(|_| Ok(()));
        let sink = journaled.clone();
        journal
            .expect_append_header()
            .returning(move |_, header| {
                sink.lock().unwrap().push(header.to_vec());
                Ok(())
            });

        let (relay, client, tx_shutdown) = spawn_app(app_config(Some(genesis_record())), journal);
        let headers = mined_chain(&genesis_header(), 2, 0);
        for header in &headers {
            let outcome = client
                .submit_header(serialize_header(header).to_vec(), Some(true))
                .await
                .unwrap();
            assert_eq!(outcome.hash, header.block_hash());
        }

        // Rejected submissions are not journaled
        let err = client
            .submit_header(serialize_header(&headers[1]).to_vec(), Some(true))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<RelayError>(),
            Some(&RelayError::DuplicateBlock(headers[1].block_hash()))
        );

        assert_eq!(relay.read().best_height(), Some(2));
        assert_eq!(
            *journaled.lock().unwrap(),
            headers
                .iter()
                .map(|header| serialize_header(header).to_vec())
                .collect::<Vec<_>>()
        );
        tx_shutdown.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_restart_replays_journal() {
        let main = mined_chain(&genesis_header(), 2, 0);
        let fork = mined_chain(&main[0], 2, 1);
        let journaled: Vec<Vec<u8>> = main
            .iter()
            .chain(&fork)
            .map(|header| serialize_header(header).to_vec())
            .collect();

        let mut journal = MockHeaderJournal::new();
        journal
            .expect_load_genesis()
            .returning(|| Ok(Some(genesis_record())));
        journal
            .expect_load_headers()
            .returning(move || Ok(journaled.clone()));
        journal.expect_save_genesis().never();
        journal.expect_append_header().returning(|_, _| Ok(()));

        let (relay, client, tx_shutdown) = spawn_app(app_config(None), journal);
        let next = mine_declared(child_header(&fork[1], 1));
        // Requests are only served once the replay completed
        let outcome = client
            .submit_header(serialize_header(&next).to_vec(), Some(true))
            .await
            .unwrap();
        assert_eq!(outcome.height, 4);
        assert_eq!(outcome.branch_id, btc_relay::MAIN_CHAIN);
        assert_eq!(relay.read().tip().unwrap().hash, next.block_hash());
        // The old main chain block became a fork
        assert!(!relay.read().is_main_chain(&main[1].block_hash()));
        tx_shutdown.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_fork_submission_through_client() {
        let mut journal = MockHeaderJournal::new();
        journal.expect_load_genesis().returning(|| Ok(None));
        journal.expect_load_headers().returning(|| Ok(vec![]));
        journal.expect_save_genesis().returning(|_| Ok(()));
        journal.expect_append_header().returning(|_, _| Ok(()));

        let (relay, client, tx_shutdown) = spawn_app(app_config(Some(genesis_record())), journal);
        let main = mined_chain(&genesis_header(), 3, 0);
        for header in &main {
            client
                .submit_header(serialize_header(header).to_vec(), None)
                .await
                .unwrap();
        }
        let fork = mined_chain(&main[0], 2, 1);
        let first = client
            .submit_header(serialize_header(&fork[0]).to_vec(), Some(false))
            .await
            .unwrap();
        let err = client
            .submit_fork_header(serialize_header(&fork[1]).to_vec(), first.branch_id + 1)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<RelayError>(),
            Some(&RelayError::InvalidForkId)
        );
        let second = client
            .submit_fork_header(serialize_header(&fork[1]).to_vec(), first.branch_id)
            .await
            .unwrap();
        assert_eq!(second.branch_id, first.branch_id);
        assert_eq!(relay.read().best_height(), Some(3));
        tx_shutdown.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_missing_genesis_stops_server() {
        let mut journal = MockHeaderJournal::new();
        journal.expect_load_genesis().returning(|| Ok(None));
        journal.expect_load_headers().never();

        let relay = SharedRelay::new(Relay::new(relay_config()));
        let (_tx_shutdown, rx_shutdown) = broadcast::channel(1);
        let (mut server, _client) =
            create_app(app_config(None), relay.clone(), Arc::new(journal), rx_shutdown);
        assert_eq!(server.run().await, Err(()));
        assert!(!relay.read().is_initialized());
    }
}

//! Consensus Module
//!
//! Turns the answers of several untrusted proxies into one trusted answer.
//! A request is sent to every known proxy; each well-formed response is
//! reduced to a trust key and tallied, and the first key to collect
//! `consensus_threshold` agreeing responses wins. Raising the threshold means
//! that many independent proxies must collude to forge a content identifier.
//!
//! Feed and article lookups both go through the same aggregator.

mod tally;

pub use tally::{ResponseTally, Vote};

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::TrustConfig;
use crate::network::{ContentResponse, ControlRequest, ParseError, PeerTransport};
use crate::peers::PeerRoleManager;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("No proxy available")]
    NoProxies,
    #[error("Consensus unreachable: best agreement {best} of {threshold} required ({responses} responses)")]
    Unreachable {
        threshold: usize,
        best: usize,
        responses: usize,
    },
}

/// Fans requests out to known proxies and waits for agreement
pub struct ConsensusAggregator<T: PeerTransport> {
    peers: Arc<PeerRoleManager<T>>,
    config: TrustConfig,
}

impl<T: PeerTransport> ConsensusAggregator<T> {
    pub fn new(peers: Arc<PeerRoleManager<T>>, config: TrustConfig) -> Self {
        Self { peers, config }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerRoleManager<T>> {
        &self.peers
    }

    /// Send `request` to every known proxy and return the first response
    /// whose trust key reaches the threshold.
    ///
    /// Malformed responses and failed sends are logged and left out of the
    /// tally. Fails with `Unreachable` once every proxy has answered without
    /// agreement, or after `fanout_timeout`. The fan-out itself is not
    /// cancelled and keeps tallying late responses in the background.
    pub async fn request<R, K, P, F>(
        &self,
        request: &ControlRequest,
        parse: P,
        trust_key: F,
    ) -> Result<R, ConsensusError>
    where
        R: Send + 'static,
        K: Eq + Hash + Clone + Debug + Send + 'static,
        P: Fn(&str) -> Result<R, ParseError> + Send + 'static,
        F: Fn(&R) -> K + Send + 'static,
    {
        let proxies = self.peers.proxies();
        if proxies.is_empty() {
            return Err(ConsensusError::NoProxies);
        }

        let threshold = self.config.consensus_threshold.max(1);
        if proxies.len() < threshold {
            debug!(
                "Only {} proxies known for threshold {}, consensus cannot be reached",
                proxies.len(),
                threshold
            );
        }

        let payload = request.encode();
        debug!("Fanning out {:?} to {} proxies", request, proxies.len());

        let tally = Arc::new(Mutex::new(ResponseTally::new(threshold)));
        let (trusted_tx, trusted_rx) = oneshot::channel();
        let transport = Arc::clone(self.peers.transport());
        let fanout_tally = Arc::clone(&tally);

        tokio::spawn(async move {
            let mut trusted_tx = Some(trusted_tx);
            let mut responses: FuturesUnordered<_> = proxies
                .into_iter()
                .map(|peer| {
                    let transport = Arc::clone(&transport);
                    let payload = payload.clone();
                    async move { (peer, transport.send(&peer, payload).await) }
                })
                .collect();

            while let Some((peer, result)) = responses.next().await {
                let raw = match result {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Request to proxy {} failed: {}", peer, e);
                        continue;
                    }
                };
                let response = match parse(&raw) {
                    Ok(response) => response,
                    Err(e) => {
                        debug!("Discarding malformed response from {}: {}", peer, e);
                        continue;
                    }
                };

                let key = trust_key(&response);
                let vote = fanout_tally.lock().record(peer, key.clone());
                match vote {
                    Vote::Trusted => {
                        if let Some(tx) = trusted_tx.take() {
                            info!("Consensus reached on {:?}", key);
                            let _ = tx.send(response);
                        }
                    }
                    Vote::Counted => debug!("Proxy {} answered {:?}", peer, key),
                    Vote::Duplicate => debug!("Ignoring repeated answer from {}", peer),
                }
            }

            let tally = fanout_tally.lock();
            debug!(
                "Fan-out finished: {} responses, best agreement {}",
                tally.responses(),
                tally.best_count()
            );
        });

        match tokio::time::timeout(self.config.fanout_timeout, trusted_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                let tally = tally.lock();
                warn!(
                    "No consensus for {:?}: best agreement {} of {}",
                    request,
                    tally.best_count(),
                    threshold
                );
                Err(ConsensusError::Unreachable {
                    threshold,
                    best: tally.best_count(),
                    responses: tally.responses(),
                })
            }
        }
    }

    /// Resolve a feed or article request to an agreed content identifier
    pub async fn resolve_content(
        &self,
        request: &ControlRequest,
    ) -> Result<ContentResponse, ConsensusError> {
        self.request(request, ContentResponse::parse, |response: &ContentResponse| {
            response.info_hash.to_ascii_lowercase()
        })
        .await
    }
}

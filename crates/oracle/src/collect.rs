//! Concurrent node-feed collection.
//!
//! Every configured node is asked for its current feed in parallel; the
//! round proceeds with whatever subset responds with a verifiable message.
//! A slow, unreachable or lying node costs itself a reward, never the
//! round.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use feedline_core::{NodeFeedMessage, NodeId, PolicyId, PosixTime, SignedNodeMessage};

use crate::OracleError;

/// A configured oracle node: where to reach it and the key its feeds must
/// verify against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub url: String,
    /// Expected ed25519 verifying key; also the node's identity.
    pub node_id: NodeId,
}

/// Feed request sent to every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRequest {
    pub validity_start: PosixTime,
    pub validity_end: PosixTime,
    /// Hex-encoded policy id of the oracle being served.
    pub oracle_policy_id: String,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    feed_value: u64,
    timestamp: PosixTime,
    /// Hex-encoded signature over the feed message digest.
    signature: String,
}

pub struct FeedCollector {
    client: reqwest::Client,
    policy: PolicyId,
}

impl FeedCollector {
    pub fn new(policy: PolicyId, timeout: Duration) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(feedline_chain::ChainError::from)?;
        Ok(FeedCollector { client, policy })
    }

    /// Collects verified feeds from all nodes concurrently.
    ///
    /// Nodes that fail to respond, respond malformed, sign badly, or
    /// timestamp outside the validity window are dropped. The result maps
    /// node id to feed value; an empty map is returned as-is and left for
    /// the caller to treat as a consensus failure.
    pub async fn collect(
        &self,
        nodes: &[NodeEndpoint],
        request: &FeedRequest,
    ) -> BTreeMap<NodeId, u64> {
        let responses = join_all(nodes.iter().map(|node| self.collect_one(node, request))).await;

        let mut feeds = BTreeMap::new();
        for (node, response) in nodes.iter().zip(responses) {
            if let Some(feed) = response {
                feeds.insert(node.node_id, feed);
            }
        }
        info!(
            responding = feeds.len(),
            configured = nodes.len(),
            "node feed collection finished"
        );
        feeds
    }

    async fn collect_one(&self, node: &NodeEndpoint, request: &FeedRequest) -> Option<u64> {
        let url = format!("{}/feed", node.url);
        let response = match self.client.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(node = %hex::encode(node.node_id), %err, "node unreachable");
                return None;
            }
        };
        let response: FeedResponse = match response.error_for_status() {
            Ok(ok) => match ok.json().await {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(node = %hex::encode(node.node_id), %err, "malformed feed response");
                    return None;
                }
            },
            Err(err) => {
                warn!(node = %hex::encode(node.node_id), %err, "node returned error status");
                return None;
            }
        };

        if response.timestamp < request.validity_start || response.timestamp > request.validity_end
        {
            warn!(
                node = %hex::encode(node.node_id),
                timestamp = response.timestamp,
                "feed timestamp outside validity window"
            );
            return None;
        }

        let signature = match hex::decode(&response.signature) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(node = %hex::encode(node.node_id), %err, "invalid signature hex");
                return None;
            }
        };
        let signed = SignedNodeMessage {
            message: NodeFeedMessage {
                feed: response.feed_value,
                timestamp: response.timestamp,
                oracle_policy_id: self.policy,
            },
            signature,
            verifying_key: node.node_id,
        };
        if !signed.verify() {
            return None;
        }

        debug!(
            node = %hex::encode(node.node_id),
            feed = response.feed_value,
            "accepted node feed"
        );
        Some(response.feed_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_request_wire_format() {
        let request = FeedRequest {
            validity_start: 1_000,
            validity_end: 2_000,
            oracle_policy_id: hex::encode([7u8; 32]),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["validity_start"], 1_000);
        assert_eq!(json["validity_end"], 2_000);
        assert_eq!(json["oracle_policy_id"], hex::encode([7u8; 32]));
    }

    #[test]
    fn feed_response_parses() {
        let response: FeedResponse = serde_json::from_str(
            r#"{"feed_value": 1250000, "timestamp": 1500, "signature": "ab"}"#,
        )
        .unwrap();
        assert_eq!(response.feed_value, 1_250_000);
        assert_eq!(response.timestamp, 1_500);
    }
}

//! The autopilot delegate (spec.md §4.J): a thin adapter that computes
//! the set of non-federated peer server IDs and forwards them to the
//! consensus autopilot library.

use std::sync::Arc;

use crate::ports::AutopilotBackend;

/// A cluster peer, as known to this region.
#[derive(Debug, Clone)]
pub struct Peer {
    pub server_id: String,
    pub region: String,
}

/// Publishes server membership to a consensus autopilot library that
/// removes dead peers and promotes stabilized non-voters to voters.
/// Federated peers in other regions are never exposed (spec.md §4.I/§4.J).
pub struct AutopilotDelegate {
    backend: Arc<dyn AutopilotBackend>,
    local_region: String,
}

impl AutopilotDelegate {
    pub fn new(backend: Arc<dyn AutopilotBackend>, local_region: impl Into<String>) -> Self {
        Self {
            backend,
            local_region: local_region.into(),
        }
    }

    /// Filters `peers` down to this region and forwards their server IDs.
    pub fn publish(&self, peers: &[Peer]) {
        let server_ids: Vec<String> = peers
            .iter()
            .filter(|p| p.region == self.local_region)
            .map(|p| p.server_id.clone())
            .collect();
        self.backend.set_servers(server_ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingBackend(Mutex<Vec<String>>);
    impl AutopilotBackend for RecordingBackend {
        fn set_servers(&self, server_ids: Vec<String>) {
            *self.0.lock().unwrap() = server_ids;
        }
    }

    #[test]
    fn excludes_federated_peers() {
        let backend = Arc::new(RecordingBackend(Mutex::new(Vec::new())));
        let delegate = AutopilotDelegate::new(backend.clone(), "us-east");

        delegate.publish(&[
            Peer {
                server_id: "a".into(),
                region: "us-east".into(),
            },
            Peer {
                server_id: "b".into(),
                region: "eu-west".into(),
            },
        ]);

        assert_eq!(*backend.0.lock().unwrap(), vec!["a".to_string()]);
    }
}

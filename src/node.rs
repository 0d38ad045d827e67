//! Node — opaque to the scheduling core except for the fields the GC and
//! blocked-eval tracker consult directly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Initializing,
    Ready,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub datacenter: String,
    pub node_class: String,
    pub node_pool: String,
    pub status: NodeStatus,
    pub modify_index: u64,
}

impl Node {
    pub fn is_terminal(&self) -> bool {
        self.status == NodeStatus::Down
    }
}

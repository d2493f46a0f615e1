pub mod auth;
pub mod memory;
pub mod types;

pub use auth::{StaticToken, TokenProvider};
pub use memory::{MemoryControlPlane, DELETION_PROTECTION_MESSAGE};
pub use types::{
    ApiError, Cluster, ClusterApi, Host, Operation, OperationOutcome, RedisConfigPatch,
    RemoteStatus, ResourcesPatch, Shard, StatusCode, UpdateClusterRequest,
};

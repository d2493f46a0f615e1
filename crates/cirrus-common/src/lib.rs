pub mod cluster_spec;
pub mod cluster_state;

pub use cluster_spec::{
    ClusterSpec, Environment, HostSpec, MaintenanceWindow, RedisConfig, Resources, WeekDay,
};
pub use cluster_state::{ClusterState, ClusterStatus, HostState, ShardState};

pub mod telemetry;

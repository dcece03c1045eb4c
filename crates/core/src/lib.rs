pub mod config;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod sh;
pub mod template;

pub use config::{ClusterSettings, Role, RoleGroupSettings, Settings};
pub use error::{ClusterFailure, FleetError, ProviderError, Result};
pub use lifecycle::{ExistingClusterPolicy, Lifecycle, MemberStatus};
pub use provider::{
    CloudAdapter, InstanceDescription, InstanceProvider, InstanceRequest, InstanceState,
    MarketType, PollSettings,
};
pub use registry::{InstanceRecord, Registry};
pub use sh::{CommandRunner, Executor, SshTarget, Target};

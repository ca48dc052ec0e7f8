// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod command;
pub mod control_plane;
pub mod controller_client;
pub mod credential;
pub mod deletion_watcher;
pub mod error;
pub mod kwok;
pub mod manifest;
pub mod mock;
pub mod orchestrator;
pub mod provisioner;
pub mod proxy;
pub mod rehydrate;
pub mod templates;

#[cfg(test)]
mod testing;

// Re-export primary types
pub use error::{Result, RuntimeError};
pub use control_plane::{ControlPlane, CLUSTER_LABEL};
pub use kwok::{KwokConfig, KwokControlPlane};
pub use mock::{MockControlPlane, MockController};

// Re-export controller client types
pub use controller_client::{ControllerApi, ControllerConfig, RancherClient};

// Re-export lifecycle types
pub use credential::{CredentialBootstrapper, CredentialConfig};
pub use deletion_watcher::{DeletionWatcher, DeletionWatcherConfig};
pub use orchestrator::{ClusterDetail, Components, Orchestrator, OrchestratorConfig};
pub use provisioner::TenantProvisioner;
pub use proxy::{ProxyConfig, ProxySupervisor};
pub use rehydrate::{rehydrate, RehydrationReport};
pub use templates::TemplateConfig;

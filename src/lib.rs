pub mod cloudstack;
pub mod config;
pub mod error;
pub mod hostname;
pub mod image;
pub mod logger;
pub mod migrate;
pub mod session;
pub mod transfer;

pub use error::CirrusError;

pub type Result<T> = std::result::Result<T, CirrusError>;

// Convenience re-exports for the migration workflow
pub use cloudstack::{CloudStackClient, ControlPlane, DeploySpec, JobStatus};
pub use migrate::{
    MigrationOrchestrator, MigrationOutcome, MigrationRequest, MigrationSettings, MigrationStage,
};
pub use session::{RemoteSession, SessionFactory};

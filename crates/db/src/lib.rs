pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect_with_settings, ping, DbPool};
pub use fixtures::{DemoSeedDataset, FlowSeedInfo, SeedResult, VerificationResult, DEMO_TENANT_ID};
pub use repositories::{
    DueFlowQuery, EventRepository, FlowRepository, InMemoryEventRepository,
    InMemoryFlowRepository, RepositoryError, SqlEventRepository, SqlFlowRepository,
};

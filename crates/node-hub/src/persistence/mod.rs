use sqlx::SqlitePool;

pub mod migrations;
pub mod nodes;
pub mod subscriptions;
pub mod usage;

pub type Db = SqlitePool;

pub use migrations::{MigrationLabel, MigrationRunOutcome, MigrationSnapshot};
pub use nodes::{AgentInfoUpdate, NewNode, NodeRecord};
pub use subscriptions::{NewSubscription, SubscriptionRecord, SubscriptionStatus};

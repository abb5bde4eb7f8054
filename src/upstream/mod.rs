pub mod health;
pub mod target;

pub use health::{build_health_check_client, HealthState, HealthStore, HealthcheckManager, Prober};
pub use target::Target;

pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;

pub use error::{AppError, AppResult};
pub use models::{Account, AppConfig, StrategyKind};
pub use modules::persistence::AccountStore;
pub use proxy::executor::{ExecuteRequest, Execution, RequestExecutor};
pub use proxy::payload::{CloudCodePayloadBuilder, PayloadBuilder};
pub use proxy::pool::{AccountPool, AuthClient};
pub use proxy::refresher::QuotaRefresher;
pub use proxy::upstream::{CloudCodeClient, StreamEvent};

pub use app_error::{AppError, AppResult};
pub use config::ServerConfig;
pub use registry::SessionRegistry;
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
mod registry;
mod server;
mod shutdown;
mod tracing_config;

pub mod config;
pub mod dap;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod rpc;
pub mod session;

pub use error::Error;
pub use session::manager::SessionManager;

pub type Result<T> = std::result::Result<T, Error>;

pub async fn serve() -> Result<()> {
    let manager = std::sync::Arc::new(SessionManager::new(config::CoreEnv::from_env()));
    rpc::serve_stdio(manager).await
}

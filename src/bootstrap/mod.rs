mod gateway;
mod server;
mod shutdown;

pub use gateway::Gateway;
pub use server::Server;
pub use shutdown::{ShutdownManager, ShutdownState};

pub mod config;
pub mod health;
pub mod hub;
pub mod queue;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod shared;

pub use config::{RegistryMode, ServerConfig, SessionConfig};
pub use hub::{Hub, HubHandle};
pub use queue::{outbound_queue, QueueHandle, QueueReceiver};
pub use registry::{Registry, RouteStats};
pub use router::{MessageRouter, RouterError};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{run_session, SessionContext, SessionReport};
pub use shared::SharedRegistry;

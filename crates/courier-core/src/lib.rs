pub mod errors;
pub mod ids;
pub mod message;
pub mod traits;

pub use errors::{AuthError, DecodeError, PersistenceError, RouteError, TransportError};
pub use ids::{ConnectionId, MessageId, Principal};
pub use message::{Message, MessageKind, WireMessage};
pub use traits::{AuthGate, MessageStore};

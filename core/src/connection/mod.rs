/// Push channel connection management
pub mod controller;
pub mod state;
pub mod transport;

pub use controller::{ConnectionController, ConnectionEvent, SendOutcome};
pub use state::{
    Closure, ConnectionState, ConnectionStatus, EndpointKey, ReconnectDecision, ReconnectPolicy,
};
pub use transport::{InboundFrame, PushSocket, PushTransport, WsTransport};

// Live channel layer: Pusher-protocol broker connection with private channel auth.

pub mod auth;
pub mod config;
pub mod frames;
pub mod subscriptions;
pub mod transport;

mod connection;
mod error;

pub use auth::{ChannelAuth, ChannelAuthorizer, HttpChannelAuthorizer};
pub use config::BrokerConfig;
pub use error::{NetError, Result};
pub use subscriptions::{channel_names, EventStream, SubscriptionHandle, SubscriptionManager};
pub use transport::{Connector, FrameStream, TransportFrame, WebSocketConnector};

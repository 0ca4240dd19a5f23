/// Application name
pub const APP_NAME: &str = "Gigline";

/// Client identifier reported to the broker in the socket URL
pub const CLIENT_NAME: &str = "gigline-rs";

/// Pusher channels protocol revision spoken by the connection
pub const PUSHER_PROTOCOL_VERSION: u8 = 7;

/// Broadcast channel every `MessageSent` event is published on
pub const MESSAGE_SENT_CHANNEL: &str = "private-message.sent";

/// Prefix of the private per-user notification channel
pub const USER_CHANNEL_PREFIX: &str = "private-App.Models.User.";

/// Fully qualified broadcast event names (Laravel Echo namespace `App.Events`)
pub const EVENT_MESSAGE_SENT: &str = "App\\Events\\MessageSent";
pub const EVENT_NOTIFICATION_CREATED: &str =
    "Illuminate\\Notifications\\Events\\BroadcastNotificationCreated";

/// Broker-internal event names
pub const PUSHER_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const PUSHER_ERROR: &str = "pusher:error";
pub const PUSHER_PING: &str = "pusher:ping";
pub const PUSHER_PONG: &str = "pusher:pong";
pub const PUSHER_SUBSCRIBE: &str = "pusher:subscribe";
pub const PUSHER_UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const PUSHER_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const PUSHER_SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";

/// Idle time before the client pings the broker, unless the broker says otherwise
pub const DEFAULT_ACTIVITY_TIMEOUT_SECS: u64 = 120;

/// How long to wait for a pong before declaring the connection dropped
pub const DEFAULT_PONG_TIMEOUT_SECS: u64 = 30;

/// Socket connect + handshake + channel auth budget
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Per-request timeout for REST calls
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Capacity of the live event queue between the connection task and its consumer
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Default Pusher cluster
pub const DEFAULT_PUSHER_CLUSTER: &str = "ap1";

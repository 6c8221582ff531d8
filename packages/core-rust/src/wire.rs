//! Protocol constants agreed on by every node of the fabric.

use std::time::Duration;

/// Command for the first envelope a client may send on a fresh connection.
pub const COMMAND_LOGIN_SIGNIN: &str = "login.signin";
/// Command forwarded to the login service when a channel disconnects.
pub const COMMAND_LOGIN_SIGNOUT: &str = "login.signout";

/// Service name of the login tier.
pub const SN_LOGIN: &str = "login";
/// Service name of the chat tier.
pub const SN_CHAT: &str = "chat";

/// Meta key: service id of the gateway that owns the originating channel.
/// Stamped on forward so the callee knows where to push responses.
pub const META_DEST_SERVER: &str = "dest_server";
/// Meta key: comma-separated channel ids a pushed envelope fans out to.
pub const META_DEST_CHANNELS: &str = "dest_channels";
/// Meta key on discovered service records: warm-up state (`young`/`adult`).
pub const META_SERVICE_STATE: &str = "service_state";
/// Channel metadata key: authenticated account.
pub const META_ACCOUNT: &str = "account";
/// Channel metadata key: application the token was minted for.
pub const META_APP: &str = "app";

/// Warm-up states of a discovered service record.
pub const STATE_YOUNG: &str = "young";
pub const STATE_ADULT: &str = "adult";

/// Protocol tags carried in service records.
pub const PROTOCOL_TCP: &str = "tcp";
pub const PROTOCOL_WS: &str = "ws";

/// Deadline armed before every frame read.
pub const DEFAULT_READ_WAIT: Duration = Duration::from_secs(3 * 60);
/// Deadline armed before every frame write.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
/// Deadline for reading the first frame of a fresh connection.
pub const DEFAULT_LOGIN_WAIT: Duration = Duration::from_secs(10);
/// Cadence of transport-level pings from peer clients. Kept well under
/// `DEFAULT_READ_WAIT` so an idle but healthy link never trips the read
/// deadline.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(55);

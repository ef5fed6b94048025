//! Realtime messaging and presence layer for the Deskwire support
//! dashboard and embeddable chat widget.
//!
//! ARCHITECTURE
//! ============
//! Everything rides named pub/sub topics on a hosted realtime service:
//!
//! - [`names`] owns the canonical topic grammar shared by every surface
//! - [`pool`] owns connections: one [`pool::ChannelPool`] per
//!   organization multiplexes topics, maintains health, and reconnects
//!   with exponential backoff
//! - [`org`] turns the organization channel (broadcasts + database
//!   change feed) into one deduplicated event stream for the inbox UI
//! - [`typing`] exchanges throttled live typing previews per
//!   conversation
//! - [`presence`] and [`broadcast`] are fire-and-forget senders for
//!   status signals and message/conversation notifications
//!
//! Transports are pluggable behind [`transport::Transport`]:
//! [`transport::ws::WsTransport`] speaks to the hosted service, and
//! [`transport::memory::MemoryHub`] is an in-process broker for tests
//! and local development.

pub mod broadcast;
pub mod config;
pub mod dedup;
pub mod envelope;
pub mod names;
pub mod org;
pub mod pool;
pub mod presence;
pub mod retry;
pub mod transport;
pub mod typing;

pub use broadcast::Broadcaster;
pub use config::{ConfigError, RealtimeConfig};
pub use envelope::{Envelope, PresenceStatus, Source};
pub use org::{OrgEvent, OrgRealtime};
pub use pool::{ChannelPool, ConnectionHealth, ConnectionStatus, PoolError, PoolEvent, PoolSet, Subscription};
pub use transport::{ChangeEvent, ChangeKind, Connection, Inbound, Transport, TransportError};
pub use typing::{TypingPreview, TypingUser};

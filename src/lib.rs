//! Async client for the Risco local (LAN) alarm-panel wire protocol.
//!
//! Speaks the proprietary framed, optionally-encrypted TCP dialect
//! used by Risco's WiComm/Agility/LightSys/ProsysPlus panel families:
//! logs in with a numeric access code, enumerates partitions and
//! zones, issues control commands, and surfaces the panel's
//! asynchronous status pushes through a small observer API.
//!
//! ```no_run
//! # async fn go() -> risco_local::RiscoResult<()> {
//! let panel = risco_local::connect("192.168.1.50", 1000, "1234", Default::default()).await?;
//! panel.add_event_handler(|text| println!("event: {text}"));
//! panel.arm(1).await?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod connection;
mod crc;
mod error;
mod events;
mod keystream;
mod multiplexer;
mod panel;
mod partition;
mod transport;
mod zone;

pub use config::{Config, Encoding};
pub use error::{OperationErrorKind, RiscoError, RiscoResult};
pub use events::HandlerId;
pub use panel::{Capabilities, GroupSelector, Panel};
pub use partition::{Partition, PartitionOps};
pub use zone::{Zone, ZoneOps};

/// Connect to `host:port`, authenticate with `code`, and enumerate the
/// panel's partitions and zones. See [`Panel::connect`].
pub async fn connect(host: &str, port: u16, code: &str, config: Config) -> RiscoResult<Panel> {
    Panel::connect(host, port, code, config).await
}

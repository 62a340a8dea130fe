#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod channel;
pub use channel::{ChannelHandle, ChannelStatus, LiveChannel};

mod config;
pub use config::{
    ChannelConfig, ConfigError, DEFAULT_BASE_URL, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_KEEP_ALIVE_PAYLOAD, DEFAULT_RECONNECT_DELAY,
};

mod machine;
pub use machine::{ChannelMachine, Command, Input};

pub mod relay;

mod session;
pub use session::{SessionStore, ViewerSession};

mod traits;
pub use traits::{Link, Transport};

mod transport;
pub use transport::{WsLink, WsTransport};

mod types;
pub use types::{
    ChannelError, ChannelEvent, ChannelState, CloseReason, Generation, OrganizationId, Payload,
    TransportError,
};

pub mod error;
pub mod mux;

pub use error::MuxError;
pub use mux::{
    classify, strip_proxy_header, Backends, BytePreview, ConnState, HeaderLimits, Listener,
    ListenerConfig, ListenerStats, PendingConnection, ProxyVersion, SpliceStats, StripOutcome,
    StrippedHeader, Target,
};

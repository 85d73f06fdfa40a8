//! Persistent SSH local port forwards, one per (user, host, local port).
//!
//! Nothing is remembered between invocations. A tunnel is running exactly
//! when ssh's control socket for its identity answers `-O check`.

mod identity;
mod manager;
mod ssh;

pub use identity::TunnelIdentity;
pub use manager::{
    StartOutcome, StopOutcome, TunnelError, TunnelManager, TunnelSpec, TunnelStatus,
    DEFAULT_REMOTE_PORT, MAX_CONTROL_PATH_BYTES,
};

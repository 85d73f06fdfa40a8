//! Background `kubectl port-forward` processes that outlive the CLI.
//!
//! Each forward is named by its namespace and local port. The pid file
//! derived from that pair is the only state; it is re-read on every call.

mod identity;
mod manager;
mod pidfile;
mod ready;

pub use identity::PortForwardIdentity;
pub use manager::{
    PortForwardError, PortForwardManager, PortForwardSpec, PortForwardStatus, StartOutcome,
    StopOutcome,
};
pub use ready::wait_ready;

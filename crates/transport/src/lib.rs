//! devsync-transport: Remote transports
//!
//! [`SshTransport`] drives the system `ssh` client over a shared master
//! connection; [`LocalTransport`] targets a directory on this machine.

pub mod local;
pub mod ssh;

pub use local::LocalTransport;
pub use ssh::SshTransport;

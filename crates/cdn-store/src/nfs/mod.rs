//! Network-filesystem driver.
//!
//! Every handle dials the server, mounts the export with AUTH_UNIX
//! credentials, and works through the mounted [`Target`]. Closing a handle
//! releases the file, the mount session, and the connection in that order.
//!
//! Protocol clients plug in through [`MountDialer`]. [`RpcDialer`] speaks
//! NFSv3 over TCP and is the default. [`ExportDialer`] serves exports from
//! a directory tree already reachable on this host, such as a kernel mount
//! point or a test fixture.

mod driver;
mod export;
mod net;
mod rpc;
mod session;
mod xdr;

pub use driver::{NfsDriver, NfsFactory};
pub use export::ExportDialer;
pub use net::{RpcDialer, PORTMAP_PORT};
pub use session::{AuthUnix, FileAttr, Mount, MountDialer, RemoteFile, Target};

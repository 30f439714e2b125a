//! Guest-side virtual filesystem. Hypervisor-designated paths are served by
//! forwarding every read, write, ioctl and size query to the host over a
//! hypercall boundary; everything else is passed through to a real directory
//! tree, with implied directories synthesized in between.

pub mod bridge;
pub mod devmux;
pub mod fuse;
pub mod hypercall;
pub mod mergedir;
pub mod passthrough;
pub mod paths;
pub mod router;
pub mod session;
pub mod wire;

pub use bridge::{Bridge, BridgeConfig, FileOp};
pub use devmux::{DeviceTable, MuxConfig, MuxError};
pub use hypercall::{GuestPort, HypercallPort};
pub use passthrough::{DirPassthrough, Passthrough};
pub use paths::{HyperPathSet, PathClass, PathSetError};
pub use router::{Ctx, HyperFs};
pub use session::{Session, SessionError};

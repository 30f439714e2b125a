//! Marshals one filesystem operation, guarantees residency of every byte the
//! host will walk, traps, and retries on the busy sentinel.

use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::trace;

use crate::hypercall::{HypercallPort, HC_FILE_OP, HC_STATUS_RETRY};
use crate::wire::{GetAttrMsg, IoctlMsg, OpHeader, ReadMsg, WriteMsg, OP_GETATTR, OP_IOCTL, OP_READ, OP_WRITE};

/// One forwarded operation. Buffers are borrowed for the duration of
/// [`Bridge::perform`] only; nothing is retained past return.
pub enum FileOp<'a> {
    Read { buf: &'a mut [u8], offset: i64 },
    Write { buf: &'a [u8], offset: i64 },
    Ioctl { cmd: u32, arg: u64 },
    GetAttr { size_out: &'a mut i64 },
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Bound on busy-retry iterations. `None` (the default) retries forever,
    /// so an unresponsive host stalls the operation indefinitely. When set,
    /// exceeding the bound fails with `ETIMEDOUT`.
    pub max_retries: Option<u64>,
}

pub struct Bridge {
    port: Arc<dyn HypercallPort>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(port: Arc<dyn HypercallPort>, config: BridgeConfig) -> Self {
        Self { port, config }
    }

    /// Forward one operation to the host. Returns the host's result verbatim
    /// (byte count for read/write, op-specific for ioctl, 0 for getattr);
    /// any negative outcome other than the retry sentinel is surfaced as the
    /// corresponding errno with no translation.
    pub fn perform(&self, path: &str, mut op: FileOp<'_>) -> Result<i64, Errno> {
        let mut retries = 0u64;
        loop {
            // The host walks path and buffer memory directly while emulating
            // the trap and cannot service a fault mid-emulation. Touch every
            // byte on every attempt: residency can be lost between retries.
            touch_bytes(path.as_bytes());
            match &op {
                FileOp::Read { buf, .. } => touch_bytes(buf),
                FileOp::Write { buf, .. } => touch_bytes(buf),
                FileOp::Ioctl { .. } | FileOp::GetAttr { .. } => {}
            }

            let ret = self.trap(path, &mut op);
            if ret == HC_STATUS_RETRY {
                retries += 1;
                if let Some(max) = self.config.max_retries {
                    if retries > max {
                        return Err(Errno::ETIMEDOUT);
                    }
                }
                trace!(path, retries, "host busy, reissuing");
                continue;
            }
            return if ret < 0 {
                Err(Errno::from_raw(-ret as i32))
            } else {
                Ok(ret)
            };
        }
    }

    fn trap(&self, path: &str, op: &mut FileOp<'_>) -> i64 {
        let hdr = |tag: u32| OpHeader {
            op: tag,
            path_ptr: path.as_ptr() as u64,
            path_len: path.len() as u64,
        };

        // The record lives on this stack frame for exactly one trap; the
        // host consumes it synchronously.
        match op {
            FileOp::Read { buf, offset } => {
                let mut msg = ReadMsg {
                    hdr: hdr(OP_READ),
                    buf_ptr: buf.as_mut_ptr() as u64,
                    len: buf.len() as u64,
                    offset: *offset,
                };
                self.call_one(&mut msg as *mut ReadMsg as *mut c_void)
            }
            FileOp::Write { buf, offset } => {
                let mut msg = WriteMsg {
                    hdr: hdr(OP_WRITE),
                    buf_ptr: buf.as_ptr() as u64,
                    len: buf.len() as u64,
                    offset: *offset,
                };
                self.call_one(&mut msg as *mut WriteMsg as *mut c_void)
            }
            FileOp::Ioctl { cmd, arg } => {
                let mut msg = IoctlMsg {
                    hdr: hdr(OP_IOCTL),
                    cmd: *cmd,
                    arg: *arg,
                };
                self.call_one(&mut msg as *mut IoctlMsg as *mut c_void)
            }
            FileOp::GetAttr { size_out } => {
                let size_ptr: *mut i64 = &mut **size_out;
                let mut msg = GetAttrMsg {
                    hdr: hdr(OP_GETATTR),
                    size_ptr: size_ptr as u64,
                };
                self.call_one(&mut msg as *mut GetAttrMsg as *mut c_void)
            }
        }
    }

    fn call_one(&self, msg: *mut c_void) -> i64 {
        self.port.call(HC_FILE_OP, &mut [msg])
    }
}

/// Fault every page of `bytes` in by reading each byte through a volatile
/// load the compiler cannot elide. Whole extents, not first pages: a
/// multi-page buffer can be resident and non-resident page by page.
pub(crate) fn touch_bytes(bytes: &[u8]) {
    let mut acc: u8 = 0;
    for b in bytes {
        acc = acc.wrapping_add(unsafe { ptr::read_volatile(b) });
    }
    std::hint::black_box(acc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records the raw request bytes of every HC_FILE_OP trap and replies
    /// from a scripted list of results.
    struct ScriptedPort {
        replies: Mutex<Vec<i64>>,
        seen: Mutex<Vec<Vec<u8>>>,
        fill: Option<Vec<u8>>,
    }

    impl ScriptedPort {
        fn new(replies: Vec<i64>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
                fill: None,
            }
        }
    }

    impl HypercallPort for ScriptedPort {
        fn call(&self, num: u64, args: &mut [*mut c_void]) -> i64 {
            assert_eq!(num, HC_FILE_OP);
            assert_eq!(args.len(), 1);

            // Snapshot the record exactly as the host would read it.
            let hdr = unsafe { *(args[0] as *const OpHeader) };
            let size = match hdr.op {
                OP_READ => std::mem::size_of::<ReadMsg>(),
                OP_WRITE => std::mem::size_of::<WriteMsg>(),
                OP_IOCTL => std::mem::size_of::<IoctlMsg>(),
                OP_GETATTR => std::mem::size_of::<GetAttrMsg>(),
                other => panic!("unknown op tag {other}"),
            };
            let bytes =
                unsafe { std::slice::from_raw_parts(args[0] as *const u8, size) }.to_vec();
            self.seen.lock().unwrap().push(bytes);

            let ret = self.replies.lock().unwrap().remove(0);
            if ret >= 0 {
                if let Some(fill) = &self.fill {
                    if hdr.op == OP_READ {
                        let msg = unsafe { *(args[0] as *const ReadMsg) };
                        let n = (msg.len as usize).min(fill.len());
                        unsafe {
                            ptr::copy_nonoverlapping(fill.as_ptr(), msg.buf_ptr as *mut u8, n)
                        };
                    }
                }
            }
            ret
        }
    }

    fn bridge(port: ScriptedPort) -> (Arc<ScriptedPort>, Bridge) {
        let port = Arc::new(port);
        let b = Bridge::new(port.clone(), BridgeConfig::default());
        (port, b)
    }

    #[test]
    fn read_returns_host_byte_count() {
        let mut port = ScriptedPort::new(vec![5]);
        port.fill = Some(b"hello".to_vec());
        let (_, bridge) = bridge(port);

        let mut buf = [0u8; 4096];
        let n = bridge
            .perform("/dev/vfile", FileOp::Read { buf: &mut buf, offset: 0 })
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn retry_sentinel_replays_identical_request() {
        let (port, bridge) = bridge(ScriptedPort::new(vec![
            HC_STATUS_RETRY,
            HC_STATUS_RETRY,
            4,
        ]));

        let data = b"data";
        let n = bridge
            .perform("/dev/vfile", FileOp::Write { buf: data, offset: 8 })
            .unwrap();
        assert_eq!(n, 4);

        // Three traps, all byte-identical, and the loop stopped on the first
        // non-retry result.
        let seen = port.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], seen[1]);
        assert_eq!(seen[1], seen[2]);
    }

    #[test]
    fn host_errno_is_surfaced_verbatim() {
        let (_, bridge) = bridge(ScriptedPort::new(vec![-(libc::ENXIO as i64)]));
        let err = bridge
            .perform("/dev/vfile", FileOp::Ioctl { cmd: 0x1234, arg: 0 })
            .unwrap_err();
        assert_eq!(err, Errno::ENXIO);
    }

    #[test]
    fn retry_bound_times_out() {
        let port = Arc::new(ScriptedPort::new(vec![HC_STATUS_RETRY; 10]));
        let bridge = Bridge::new(
            port,
            BridgeConfig {
                max_retries: Some(3),
            },
        );
        let mut size = 0i64;
        let err = bridge
            .perform("/f", FileOp::GetAttr { size_out: &mut size })
            .unwrap_err();
        assert_eq!(err, Errno::ETIMEDOUT);
    }

    #[test]
    fn getattr_passes_size_pointer() {
        struct SizePort;
        impl HypercallPort for SizePort {
            fn call(&self, _num: u64, args: &mut [*mut c_void]) -> i64 {
                let msg = unsafe { *(args[0] as *const GetAttrMsg) };
                unsafe { *(msg.size_ptr as *mut i64) = 1337 };
                0
            }
        }

        let bridge = Bridge::new(Arc::new(SizePort), BridgeConfig::default());
        let mut size = 0i64;
        bridge
            .perform("/dev/vfile", FileOp::GetAttr { size_out: &mut size })
            .unwrap();
        assert_eq!(size, 1337);
    }
}

//! CUSE device multiplexing: one character device per virtual file, served
//! by a dedicated worker thread, all under a shared auto-allocated major.
//! The first worker lets the kernel pick the major; the rest reuse it so
//! the devices form one family. Spawning is sequential, so minors follow
//! registration order.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::fd::FromRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::{debug, error, info};
use vm_memory::ByteValued;

use crate::bridge::{Bridge, FileOp};
use crate::fuse;
use crate::paths::HyperPathSet;

const CUSE_DEV: &str = "/dev/cuse";
const MAX_TRANSFER: u32 = 131072;
const NODE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Buffer sized for a max_write transfer plus headers.
const REQUEST_BUF: usize = MAX_TRANSFER as usize + 4096;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("cuse handshake for {path}: {source}")]
    Handshake { path: String, source: io::Error },
    #[error("device node {0} did not appear")]
    DeviceNodeTimeout(String),
    #[error("spawning device worker: {0}")]
    Spawn(io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct MuxConfig {
    /// Bound on waiting for a device node to materialize under `/dev`.
    /// `None` waits forever.
    pub ready_timeout: Option<Duration>,
}

/// Registered name of a virtual file's device, relative to `/dev`. The
/// path's own leading slash supplies the separator, so `/dev/vfile` becomes
/// `hyperfs/dev/vfile` and the node lands at `/dev/hyperfs/dev/vfile`.
pub fn device_name(path: &str) -> String {
    format!("hyperfs{path}")
}

fn node_path(path: &str) -> String {
    format!("/dev/{}", device_name(path))
}

/// Device numbers of every spawned virtual device, as observed on the
/// nodes devtmpfs created. Read-only once built.
#[derive(Debug, Default)]
pub struct DeviceTable {
    major: u32,
    minors: HashMap<String, u32>,
}

impl DeviceTable {
    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn len(&self) -> usize {
        self.minors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minors.is_empty()
    }

    pub fn rdev(&self, path: &str) -> Option<u64> {
        self.minors
            .get(path)
            .map(|&m| nix::sys::stat::makedev(self.major as u64, m as u64))
    }

    pub(crate) fn insert(&mut self, path: &str, rdev: u64) {
        self.major = nix::sys::stat::major(rdev) as u32;
        self.minors
            .insert(path.to_string(), nix::sys::stat::minor(rdev) as u32);
    }
}

/// Spawn one CUSE worker per entry and wait for each device node. Workers
/// outlive this call; they serve until their device is destroyed.
pub fn spawn_devices(
    set: &HyperPathSet,
    bridge: Arc<Bridge>,
    config: &MuxConfig,
) -> Result<DeviceTable, MuxError> {
    let mut table = DeviceTable::default();
    for (index, path) in set.iter().enumerate() {
        // First worker passes major 0 and the kernel allocates one; every
        // later worker reuses whatever the first node came up with.
        let dev_major = table.major;
        let worker = CuseWorker {
            path: path.to_string(),
            bridge: bridge.clone(),
            dev_major,
            dev_minor: index as u32,
        };

        let (ready_tx, ready_rx) = bounded::<Result<(), io::Error>>(1);
        std::thread::Builder::new()
            .name(format!("cusedev{index}"))
            .spawn(move || worker.run(ready_tx))
            .map_err(MuxError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                return Err(MuxError::Handshake {
                    path: path.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(MuxError::Handshake {
                    path: path.to_string(),
                    source: io::Error::from_raw_os_error(libc::EIO),
                })
            }
        }

        let rdev = wait_for_node(&node_path(path), config.ready_timeout)?;
        table.insert(path, rdev);
        debug!(path, rdev, "virtual device ready");
    }
    info!(
        major = table.major(),
        count = table.len(),
        "device multiplexer up"
    );
    Ok(table)
}

/// Poll until devtmpfs materializes the node, then report its `st_rdev`.
fn wait_for_node(node: &str, timeout: Option<Duration>) -> Result<u64, MuxError> {
    let start = Instant::now();
    loop {
        match nix::sys::stat::stat(node) {
            Ok(st) => return Ok(st.st_rdev),
            Err(_) => {
                if let Some(t) = timeout {
                    if start.elapsed() > t {
                        return Err(MuxError::DeviceNodeTimeout(node.to_string()));
                    }
                }
                std::thread::sleep(NODE_POLL_INTERVAL);
            }
        }
    }
}

/// Payload of the CUSE_INIT reply: the init record followed by the NUL
/// terminated `DEVNAME=` declaration.
fn cuse_init_payload(dev_major: u32, dev_minor: u32, name: &str) -> Vec<u8> {
    let init = fuse::CuseInitOut {
        major: fuse::KERNEL_VERSION,
        minor: fuse::KERNEL_MINOR_VERSION,
        flags: fuse::CUSE_UNRESTRICTED_IOCTL,
        max_read: MAX_TRANSFER,
        max_write: MAX_TRANSFER,
        dev_major,
        dev_minor,
        ..Default::default()
    };
    let mut payload = init.as_slice().to_vec();
    payload.extend_from_slice(b"DEVNAME=");
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload
}

struct CuseWorker {
    path: String,
    bridge: Arc<Bridge>,
    dev_major: u32,
    dev_minor: u32,
}

impl CuseWorker {
    fn run(self, ready_tx: crossbeam_channel::Sender<Result<(), io::Error>>) {
        let dev = match self.open_and_init() {
            Ok(dev) => {
                let _ = ready_tx.send(Ok(()));
                dev
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        if let Err(e) = self.serve(&dev) {
            error!(path = %self.path, error = %e, "device worker failed");
        }
    }

    fn open_and_init(&self) -> io::Result<File> {
        let fd = nix::fcntl::open(CUSE_DEV, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let dev = unsafe { File::from_raw_fd(fd) };

        let mut buf = vec![0u8; 8192];
        let (hdr, body) = fuse::read_request(&dev, &mut buf)?
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;
        if hdr.opcode != fuse::CUSE_INIT {
            return Err(io::Error::from_raw_os_error(libc::EPROTO));
        }
        let init: fuse::CuseInitIn =
            fuse::parse(&body).ok_or_else(|| io::Error::from_raw_os_error(libc::EPROTO))?;
        if init.major != fuse::KERNEL_VERSION {
            return Err(io::Error::from_raw_os_error(libc::EPROTO));
        }

        let payload = cuse_init_payload(self.dev_major, self.dev_minor, &device_name(&self.path));
        fuse::reply(&dev, hdr.unique, 0, &payload)?;
        Ok(dev)
    }

    fn serve(&self, dev: &File) -> io::Result<()> {
        let mut buf = vec![0u8; REQUEST_BUF];
        loop {
            let Some((hdr, body)) = fuse::read_request(dev, &mut buf)? else {
                debug!(path = %self.path, "device destroyed, worker exiting");
                return Ok(());
            };
            self.dispatch(dev, &hdr, &body)?;
        }
    }

    fn dispatch(&self, dev: &File, hdr: &fuse::InHeader, body: &[u8]) -> io::Result<()> {
        match hdr.opcode {
            fuse::FUSE_OPEN => {
                let out = fuse::OpenOut {
                    fh: 0,
                    open_flags: fuse::FOPEN_DIRECT_IO,
                    ..Default::default()
                };
                fuse::reply(dev, hdr.unique, 0, out.as_slice())
            }
            fuse::FUSE_READ => {
                let Some(req) = fuse::parse::<fuse::ReadIn>(body) else {
                    return fuse::reply_err(dev, hdr.unique, libc::EIO);
                };
                let mut data = vec![0u8; req.size.min(MAX_TRANSFER) as usize];
                match self.bridge.perform(
                    &self.path,
                    FileOp::Read {
                        buf: &mut data,
                        offset: req.offset as i64,
                    },
                ) {
                    Ok(n) => fuse::reply(dev, hdr.unique, 0, &data[..n as usize]),
                    Err(e) => fuse::reply_err(dev, hdr.unique, e as i32),
                }
            }
            fuse::FUSE_WRITE => {
                let Some(req) = fuse::parse::<fuse::WriteIn>(body) else {
                    return fuse::reply_err(dev, hdr.unique, libc::EIO);
                };
                let data = &body[size_of::<fuse::WriteIn>()..];
                if data.len() < req.size as usize {
                    return fuse::reply_err(dev, hdr.unique, libc::EIO);
                }
                match self.bridge.perform(
                    &self.path,
                    FileOp::Write {
                        buf: &data[..req.size as usize],
                        offset: req.offset as i64,
                    },
                ) {
                    Ok(n) => {
                        let out = fuse::WriteOut {
                            size: n as u32,
                            ..Default::default()
                        };
                        fuse::reply(dev, hdr.unique, 0, out.as_slice())
                    }
                    Err(e) => fuse::reply_err(dev, hdr.unique, e as i32),
                }
            }
            fuse::FUSE_IOCTL => {
                let Some(req) = fuse::parse::<fuse::IoctlIn>(body) else {
                    return fuse::reply_err(dev, hdr.unique, libc::EIO);
                };
                let cmd = req.cmd;
                match self.bridge.perform(
                    &self.path,
                    FileOp::Ioctl {
                        cmd,
                        arg: req.arg,
                    },
                ) {
                    Ok(ret) => {
                        let out = fuse::IoctlOut {
                            result: ret as i32,
                            ..Default::default()
                        };
                        fuse::reply(dev, hdr.unique, 0, out.as_slice())
                    }
                    Err(e) => fuse::reply_err(dev, hdr.unique, e as i32),
                }
            }
            // Nothing to persist or tear down on our side.
            fuse::FUSE_RELEASE | fuse::FUSE_FLUSH | fuse::FUSE_FSYNC => {
                fuse::reply(dev, hdr.unique, 0, &[])
            }
            // Operations in flight cannot be cancelled mid-trap.
            fuse::FUSE_INTERRUPT => Ok(()),
            fuse::FUSE_DESTROY => fuse::reply(dev, hdr.unique, 0, &[]),
            _ => fuse::reply_err(dev, hdr.unique, libc::ENOSYS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_fold_the_leading_slash() {
        assert_eq!(device_name("/dev/vfile"), "hyperfs/dev/vfile");
        assert_eq!(node_path("/igloo/ctl"), "/dev/hyperfs/igloo/ctl");
    }

    #[test]
    fn table_reports_combined_rdev() {
        let mut table = DeviceTable::default();
        table.insert("/dev/vfile", nix::sys::stat::makedev(240, 0));
        table.insert("/igloo/ctl", nix::sys::stat::makedev(240, 1));

        assert_eq!(table.major(), 240);
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.rdev("/dev/vfile"),
            Some(nix::sys::stat::makedev(240, 0))
        );
        assert_eq!(
            table.rdev("/igloo/ctl"),
            Some(nix::sys::stat::makedev(240, 1))
        );
        assert_eq!(table.rdev("/other"), None);
    }

    #[test]
    fn init_payload_carries_devname() {
        let payload = cuse_init_payload(240, 3, "hyperfs/dev/vfile");
        let init: fuse::CuseInitOut = fuse::parse(&payload).unwrap();
        assert_eq!(init.dev_major, 240);
        assert_eq!(init.dev_minor, 3);
        assert_eq!(init.flags, fuse::CUSE_UNRESTRICTED_IOCTL);

        let tail = &payload[size_of::<fuse::CuseInitOut>()..];
        assert_eq!(tail, b"DEVNAME=hyperfs/dev/vfile\0");
    }
}

//! The dispatch core: classifies each path and routes the operation to the
//! hypercall bridge, the synthesized directory view, or the passthrough
//! tree. Holds no per-file state beyond the device table; everything else
//! is derived per call.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::trace;

use crate::bridge::{Bridge, FileOp};
use crate::devmux::DeviceTable;
use crate::fuse::{self, FOPEN_DIRECT_IO};
use crate::mergedir::merge_listing;
use crate::passthrough::Passthrough;
use crate::paths::{HyperPathSet, PathClass};

/// Virtual files present as world-accessible character devices when the
/// device multiplexer runs, plain files otherwise. Implied directories are
/// always world-accessible.
const DEV_MODE_CHAR: u32 = libc::S_IFCHR | 0o666;
const DEV_MODE_REG: u32 = libc::S_IFREG | 0o666;
const DIR_MODE: u32 = libc::S_IFDIR | 0o777;

/// Identity of the process issuing a request, as reported by the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ctx {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

fn io_errno(e: io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))
}

/// Stable synthetic inode for a virtual path. Low bit forced on so it can
/// never be 0, which the kernel reserves.
fn synth_ino(path: &str) -> u64 {
    let mut h = DefaultHasher::new();
    path.hash(&mut h);
    h.finish() | 1
}

fn attr_from_stat(st: &libc::stat) -> fuse::Attr {
    fuse::Attr {
        ino: st.st_ino as u64,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: st.st_atime as u64,
        mtime: st.st_mtime as u64,
        ctime: st.st_ctime as u64,
        atimensec: st.st_atime_nsec as u32,
        mtimensec: st.st_mtime_nsec as u32,
        ctimensec: st.st_ctime_nsec as u32,
        mode: st.st_mode as u32,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

pub struct HyperFs {
    set: HyperPathSet,
    bridge: Arc<Bridge>,
    devices: Option<DeviceTable>,
    pass: Arc<dyn Passthrough>,
}

impl HyperFs {
    pub fn new(
        set: HyperPathSet,
        bridge: Arc<Bridge>,
        devices: Option<DeviceTable>,
        pass: Arc<dyn Passthrough>,
    ) -> Self {
        Self {
            set,
            bridge,
            devices,
            pass,
        }
    }

    pub fn classify(&self, path: &str) -> PathClass {
        self.set.classify(path)
    }

    /// Everything with no virtual answer goes here.
    pub fn passthrough(&self) -> &dyn Passthrough {
        &*self.pass
    }

    pub fn getattr(&self, path: &str, _ctx: &Ctx) -> Result<fuse::Attr, Errno> {
        match self.set.classify(path) {
            PathClass::Device => {
                let mut size = 0i64;
                self.bridge
                    .perform(path, FileOp::GetAttr { size_out: &mut size })?;
                let (mode, rdev) = match &self.devices {
                    Some(table) => (
                        DEV_MODE_CHAR,
                        table.rdev(path).unwrap_or(0) as u32,
                    ),
                    None => (DEV_MODE_REG, 0),
                };
                trace!(path, size, "virtual file attributes");
                Ok(fuse::Attr {
                    ino: synth_ino(path),
                    size: size as u64,
                    mode,
                    nlink: 1,
                    rdev,
                    blksize: 4096,
                    ..Default::default()
                })
            }
            PathClass::DirectoryPrefix => Ok(fuse::Attr {
                ino: synth_ino(path),
                mode: DIR_MODE,
                nlink: if path == "/" { 2 } else { 1 },
                blksize: 4096,
                ..Default::default()
            }),
            PathClass::NotVirtual => {
                let st = self.pass.getattr(path).map_err(io_errno)?;
                Ok(attr_from_stat(&st))
            }
        }
    }

    pub fn readlink(&self, path: &str, ctx: &Ctx) -> Result<String, Errno> {
        match self.set.classify(path) {
            PathClass::Device | PathClass::DirectoryPrefix => Err(Errno::EINVAL),
            PathClass::NotVirtual => {
                // The caller asking about /proc/self means its own process,
                // not this daemon.
                if path == "/proc/self" {
                    return Ok(format!("/proc/{}", ctx.pid));
                }
                self.pass.readlink(path).map_err(io_errno)
            }
        }
    }

    /// Returns `(fh, open_flags)`. Virtual files carry no handle state and
    /// force direct IO so every read and write reaches the host.
    pub fn open(&self, path: &str, flags: i32) -> Result<(u64, u32), Errno> {
        match self.set.classify(path) {
            PathClass::Device => Ok((0, FOPEN_DIRECT_IO)),
            PathClass::DirectoryPrefix => Err(Errno::EISDIR),
            PathClass::NotVirtual => {
                let fh = self.pass.open(path, flags).map_err(io_errno)?;
                Ok((fh, 0))
            }
        }
    }

    pub fn create(&self, path: &str, flags: i32, mode: u32) -> Result<u64, Errno> {
        match self.set.classify(path) {
            PathClass::Device | PathClass::DirectoryPrefix => Err(Errno::EEXIST),
            PathClass::NotVirtual => self.pass.create(path, flags, mode).map_err(io_errno),
        }
    }

    pub fn read(&self, path: &str, fh: u64, buf: &mut [u8], offset: i64) -> Result<usize, Errno> {
        if self.set.classify(path) == PathClass::Device {
            let n = self.bridge.perform(path, FileOp::Read { buf, offset })?;
            Ok(n as usize)
        } else {
            self.pass.read_at(fh, buf, offset).map_err(io_errno)
        }
    }

    pub fn write(&self, path: &str, fh: u64, buf: &[u8], offset: i64) -> Result<usize, Errno> {
        if self.set.classify(path) == PathClass::Device {
            let n = self.bridge.perform(path, FileOp::Write { buf, offset })?;
            Ok(n as usize)
        } else {
            self.pass.write_at(fh, buf, offset).map_err(io_errno)
        }
    }

    pub fn ioctl(&self, path: &str, fh: u64, cmd: u32, arg: u64) -> Result<i32, Errno> {
        if self.set.classify(path) == PathClass::Device {
            let ret = self.bridge.perform(path, FileOp::Ioctl { cmd, arg })?;
            Ok(ret as i32)
        } else {
            self.pass.ioctl(fh, cmd, arg).map_err(io_errno)
        }
    }

    /// Apply the requested attribute changes and report the result. Changes
    /// to a virtual file are accepted and discarded; its attributes are
    /// synthesized, so there is nothing to store.
    pub fn setattr(
        &self,
        path: &str,
        valid: u32,
        req: &fuse::SetattrIn,
        ctx: &Ctx,
    ) -> Result<fuse::Attr, Errno> {
        if self.set.classify(path) == PathClass::NotVirtual {
            if valid & fuse::FATTR_SIZE != 0 {
                self.pass
                    .truncate(path, req.size as i64)
                    .map_err(io_errno)?;
            }
            if valid & fuse::FATTR_MODE != 0 {
                self.pass
                    .chmod(path, req.mode & 0o7777)
                    .map_err(io_errno)?;
            }
            if valid & (fuse::FATTR_UID | fuse::FATTR_GID) != 0 {
                let uid = (valid & fuse::FATTR_UID != 0).then_some(req.uid);
                let gid = (valid & fuse::FATTR_GID != 0).then_some(req.gid);
                self.pass.chown(path, uid, gid).map_err(io_errno)?;
            }
        }
        self.getattr(path, ctx)
    }

    /// Full merged listing of `dir`. A directory that exists only because
    /// the path set implies it has no real listing to merge; delegated
    /// failures on such a directory yield its virtual entries alone.
    pub fn readdir(&self, dir: &str) -> Result<Vec<String>, Errno> {
        let real = match self.pass.list_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                if self.set.classify(dir) == PathClass::DirectoryPrefix {
                    Vec::new()
                } else {
                    return Err(io_errno(e));
                }
            }
        };
        Ok(merge_listing(dir, &real, &self.set, &*self.pass))
    }

    pub fn access(&self, path: &str, mask: u32) -> Result<(), Errno> {
        match self.set.classify(path) {
            PathClass::Device | PathClass::DirectoryPrefix => Ok(()),
            PathClass::NotVirtual => self.pass.access(path, mask).map_err(io_errno),
        }
    }

    pub fn release(&self, path: &str, fh: u64) -> Result<(), Errno> {
        match self.set.classify(path) {
            PathClass::Device => Ok(()),
            _ => self.pass.release(fh).map_err(io_errno),
        }
    }

    pub fn fsync(&self, path: &str, fh: u64, datasync: bool) -> Result<(), Errno> {
        match self.set.classify(path) {
            PathClass::Device => Ok(()),
            _ => self.pass.fsync(fh, datasync).map_err(io_errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::hypercall::{HypercallPort, HC_FILE_OP};
    use crate::passthrough::DirPassthrough;
    use crate::wire::{GetAttrMsg, OpHeader, ReadMsg, WriteMsg, OP_GETATTR, OP_READ, OP_WRITE};
    use std::ffi::c_void;

    /// Host fake: one virtual file holding `content`, size reported through
    /// getattr, writes acknowledged in full.
    struct OneFileHost {
        content: Vec<u8>,
    }

    impl HypercallPort for OneFileHost {
        fn call(&self, num: u64, args: &mut [*mut c_void]) -> i64 {
            assert_eq!(num, HC_FILE_OP);
            let hdr = unsafe { *(args[0] as *const OpHeader) };
            match hdr.op {
                OP_GETATTR => {
                    let msg = unsafe { *(args[0] as *const GetAttrMsg) };
                    unsafe { *(msg.size_ptr as *mut i64) = self.content.len() as i64 };
                    0
                }
                OP_READ => {
                    let msg = unsafe { *(args[0] as *const ReadMsg) };
                    let off = msg.offset as usize;
                    if off >= self.content.len() {
                        return 0;
                    }
                    let n = (self.content.len() - off).min(msg.len as usize);
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            self.content[off..].as_ptr(),
                            msg.buf_ptr as *mut u8,
                            n,
                        )
                    };
                    n as i64
                }
                OP_WRITE => {
                    let msg = unsafe { *(args[0] as *const WriteMsg) };
                    msg.len as i64
                }
                other => panic!("unexpected op {other}"),
            }
        }
    }

    fn fixture(
        paths: &[&str],
        content: &[u8],
        devices: Option<DeviceTable>,
    ) -> (tempfile::TempDir, HyperFs) {
        let dir = tempfile::tempdir().unwrap();
        let set = HyperPathSet::new(paths.iter().map(|s| s.to_string())).unwrap();
        let bridge = Arc::new(Bridge::new(
            Arc::new(OneFileHost {
                content: content.to_vec(),
            }),
            BridgeConfig::default(),
        ));
        let pass = Arc::new(DirPassthrough::new(dir.path()).unwrap());
        let fs = HyperFs::new(set, bridge, devices, pass);
        (dir, fs)
    }

    #[test]
    fn virtual_file_is_regular_without_multiplexing() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"igloo", None);
        let attr = fs.getattr("/dev/vfile", &Ctx::default()).unwrap();
        assert_eq!(attr.mode, libc::S_IFREG | 0o666);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.rdev, 0);
        assert_eq!(attr.nlink, 1);
    }

    #[test]
    fn virtual_file_is_char_device_with_multiplexing() {
        let mut table = DeviceTable::default();
        table.insert("/dev/vfile", nix::sys::stat::makedev(240, 0));
        let (_dir, fs) = fixture(&["/dev/vfile"], b"igloo", Some(table));

        let attr = fs.getattr("/dev/vfile", &Ctx::default()).unwrap();
        assert_eq!(attr.mode, libc::S_IFCHR | 0o666);
        assert_eq!(attr.rdev, nix::sys::stat::makedev(240, 0) as u32);
    }

    #[test]
    fn implied_directory_attributes() {
        let (_dir, fs) = fixture(&["/igloo/ctl"], b"", None);

        let root = fs.getattr("/", &Ctx::default()).unwrap();
        assert_eq!(root.mode, libc::S_IFDIR | 0o777);
        assert_eq!(root.nlink, 2);

        let mid = fs.getattr("/igloo", &Ctx::default()).unwrap();
        assert_eq!(mid.mode, libc::S_IFDIR | 0o777);
        assert_eq!(mid.nlink, 1);
    }

    #[test]
    fn real_files_pass_through() {
        let (dir, fs) = fixture(&["/dev/vfile"], b"", None);
        std::fs::write(dir.path().join("real"), b"abc").unwrap();

        let attr = fs.getattr("/real", &Ctx::default()).unwrap();
        assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFREG);
        assert_eq!(attr.size, 3);

        assert_eq!(
            fs.getattr("/missing", &Ctx::default()).unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn virtual_read_goes_to_host() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"hyperfile payload", None);
        let mut buf = [0u8; 6];
        let n = fs.read("/dev/vfile", 0, &mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"ile pa");
    }

    #[test]
    fn virtual_write_is_acknowledged() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"", None);
        assert_eq!(fs.write("/dev/vfile", 0, b"hello", 0).unwrap(), 5);
    }

    #[test]
    fn real_read_uses_the_handle() {
        let (dir, fs) = fixture(&["/dev/vfile"], b"", None);
        std::fs::write(dir.path().join("real"), b"contents").unwrap();

        let (fh, flags) = fs.open("/real", libc::O_RDONLY).unwrap();
        assert_eq!(flags, 0);
        let mut buf = [0u8; 8];
        assert_eq!(fs.read("/real", fh, &mut buf, 0).unwrap(), 8);
        assert_eq!(&buf, b"contents");
        fs.release("/real", fh).unwrap();
    }

    #[test]
    fn virtual_open_forces_direct_io() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"", None);
        let (fh, flags) = fs.open("/dev/vfile", libc::O_RDWR).unwrap();
        assert_eq!(fh, 0);
        assert_eq!(flags, FOPEN_DIRECT_IO);
    }

    #[test]
    fn readdir_merges_virtual_children() {
        let (dir, fs) = fixture(&["/igloo/ctl", "/igloo/log"], b"", None);
        std::fs::create_dir(dir.path().join("igloo")).unwrap();
        std::fs::write(dir.path().join("igloo/real"), b"").unwrap();

        let entries = fs.readdir("/igloo").unwrap();
        assert_eq!(entries, vec![".", "..", "real", "ctl", "log"]);
    }

    #[test]
    fn purely_virtual_directory_lists_without_real_backing() {
        let (_dir, fs) = fixture(&["/igloo/ctl"], b"", None);
        // /igloo does not exist under the passthrough root.
        assert_eq!(fs.readdir("/igloo").unwrap(), vec![".", "..", "ctl"]);
    }

    #[test]
    fn missing_real_directory_still_fails() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"", None);
        assert_eq!(fs.readdir("/nope").unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn proc_self_points_at_the_caller() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"", None);
        let ctx = Ctx {
            pid: 4242,
            ..Default::default()
        };
        assert_eq!(fs.readlink("/proc/self", &ctx).unwrap(), "/proc/4242");
    }

    #[test]
    fn readlink_on_virtual_path_is_einval() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"", None);
        let ctx = Ctx::default();
        assert_eq!(fs.readlink("/dev/vfile", &ctx).unwrap_err(), Errno::EINVAL);
        assert_eq!(fs.readlink("/dev", &ctx).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn truncating_a_virtual_file_is_accepted_and_ignored() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"12345", None);
        let req = fuse::SetattrIn {
            valid: fuse::FATTR_SIZE,
            size: 0,
            ..Default::default()
        };
        let attr = fs
            .setattr("/dev/vfile", req.valid, &req, &Ctx::default())
            .unwrap();
        // Size still comes from the host.
        assert_eq!(attr.size, 5);
    }

    #[test]
    fn create_on_virtual_path_is_refused() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"", None);
        assert_eq!(
            fs.create("/dev/vfile", libc::O_RDWR, 0o644).unwrap_err(),
            Errno::EEXIST
        );
    }

    #[test]
    fn access_on_virtual_paths_always_succeeds() {
        let (_dir, fs) = fixture(&["/dev/vfile"], b"", None);
        fs.access("/dev/vfile", libc::W_OK as u32).unwrap();
        fs.access("/dev", libc::X_OK as u32).unwrap();
        assert_eq!(
            fs.access("/missing", libc::R_OK as u32).unwrap_err(),
            Errno::ENOENT
        );
    }
}

//! The passthrough collaborator: everything that is not virtual lands here,
//! rebased onto a real directory tree. The core depends only on the trait;
//! `DirPassthrough` is the thin POSIX implementation the daemon wires in.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{AccessFlags, Gid, Uid};

fn enosys() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOSYS)
}

/// Filesystem statistics in a transport-neutral shape.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

/// Interface the core uses to reach the real filesystem. All paths are
/// absolute within the mounted namespace; implementations rebase them. File
/// handles are opaque `u64`s minted by `open`/`create` and retired by
/// `release`.
///
/// Defaults return `ENOSYS` so test stubs only implement what they probe.
#[allow(unused_variables)]
pub trait Passthrough: Send + Sync {
    /// Collision probe for the directory merger: does `path` exist on the
    /// real tree? Never follows into errors - absence and failure read the
    /// same here, as with `access(2)`.
    fn exists(&self, path: &str) -> bool {
        false
    }

    fn getattr(&self, path: &str) -> io::Result<libc::stat> {
        Err(enosys())
    }

    /// Real entries of a directory, `.`/`..` excluded (the merger emits
    /// those itself).
    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        Err(enosys())
    }

    fn readlink(&self, path: &str) -> io::Result<String> {
        Err(enosys())
    }

    fn open(&self, path: &str, flags: i32) -> io::Result<u64> {
        Err(enosys())
    }

    fn create(&self, path: &str, flags: i32, mode: u32) -> io::Result<u64> {
        Err(enosys())
    }

    fn read_at(&self, fh: u64, buf: &mut [u8], offset: i64) -> io::Result<usize> {
        Err(enosys())
    }

    fn write_at(&self, fh: u64, buf: &[u8], offset: i64) -> io::Result<usize> {
        Err(enosys())
    }

    fn ioctl(&self, fh: u64, cmd: u32, arg: u64) -> io::Result<i32> {
        Err(enosys())
    }

    fn release(&self, fh: u64) -> io::Result<()> {
        Err(enosys())
    }

    fn fsync(&self, fh: u64, datasync: bool) -> io::Result<()> {
        Err(enosys())
    }

    fn truncate(&self, path: &str, size: i64) -> io::Result<()> {
        Err(enosys())
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        Err(enosys())
    }

    fn mknod(&self, path: &str, mode: u32, rdev: u64) -> io::Result<()> {
        Err(enosys())
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        Err(enosys())
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        Err(enosys())
    }

    fn symlink(&self, target: &str, path: &str) -> io::Result<()> {
        Err(enosys())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        Err(enosys())
    }

    fn link(&self, from: &str, to: &str) -> io::Result<()> {
        Err(enosys())
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        Err(enosys())
    }

    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        Err(enosys())
    }

    fn access(&self, path: &str, mask: u32) -> io::Result<()> {
        Err(enosys())
    }

    fn statfs(&self, path: &str) -> io::Result<FsStats> {
        Err(enosys())
    }
}

/// Rebases every operation onto `root` with plain POSIX calls.
pub struct DirPassthrough {
    root: PathBuf,
}

impl DirPassthrough {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if !std::fs::metadata(&root)?.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        Ok(Self { root })
    }

    fn rebase(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn err(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn fd_result(ret: i64) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

impl Passthrough for DirPassthrough {
    fn exists(&self, path: &str) -> bool {
        nix::unistd::access(&self.rebase(path), AccessFlags::F_OK).is_ok()
    }

    fn getattr(&self, path: &str) -> io::Result<libc::stat> {
        nix::sys::stat::lstat(&self.rebase(path)).map_err(err)
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.rebase(path))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn readlink(&self, path: &str) -> io::Result<String> {
        let target = nix::fcntl::readlink(&self.rebase(path)).map_err(err)?;
        Ok(String::from_utf8_lossy(target.as_bytes()).into_owned())
    }

    fn open(&self, path: &str, flags: i32) -> io::Result<u64> {
        let fd = nix::fcntl::open(
            &self.rebase(path),
            OFlag::from_bits_truncate(flags),
            Mode::empty(),
        )
        .map_err(err)?;
        Ok(fd as u64)
    }

    fn create(&self, path: &str, flags: i32, mode: u32) -> io::Result<u64> {
        let fd = nix::fcntl::open(
            &self.rebase(path),
            OFlag::from_bits_truncate(flags) | OFlag::O_CREAT,
            Mode::from_bits_truncate(mode),
        )
        .map_err(err)?;
        Ok(fd as u64)
    }

    fn read_at(&self, fh: u64, buf: &mut [u8], offset: i64) -> io::Result<usize> {
        fd_result(unsafe {
            libc::pread(fh as i32, buf.as_mut_ptr() as *mut _, buf.len(), offset) as i64
        })
    }

    fn write_at(&self, fh: u64, buf: &[u8], offset: i64) -> io::Result<usize> {
        fd_result(unsafe {
            libc::pwrite(fh as i32, buf.as_ptr() as *const _, buf.len(), offset) as i64
        })
    }

    fn ioctl(&self, fh: u64, cmd: u32, arg: u64) -> io::Result<i32> {
        let ret = unsafe { libc::ioctl(fh as i32, cmd as libc::c_ulong, arg) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    fn release(&self, fh: u64) -> io::Result<()> {
        nix::unistd::close(fh as i32).map_err(err)
    }

    fn fsync(&self, fh: u64, datasync: bool) -> io::Result<()> {
        let ret = unsafe {
            if datasync {
                libc::fdatasync(fh as i32)
            } else {
                libc::fsync(fh as i32)
            }
        };
        fd_result(ret as i64).map(|_| ())
    }

    fn truncate(&self, path: &str, size: i64) -> io::Result<()> {
        nix::unistd::truncate(&self.rebase(path), size).map_err(err)
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        nix::unistd::mkdir(&self.rebase(path), Mode::from_bits_truncate(mode)).map_err(err)
    }

    fn mknod(&self, path: &str, mode: u32, rdev: u64) -> io::Result<()> {
        nix::sys::stat::mknod(
            &self.rebase(path),
            SFlag::from_bits_truncate(mode),
            Mode::from_bits_truncate(mode),
            rdev,
        )
        .map_err(err)
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        nix::unistd::unlink(&self.rebase(path)).map_err(err)
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        std::fs::remove_dir(self.rebase(path))
    }

    fn symlink(&self, target: &str, path: &str) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.rebase(path))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        std::fs::rename(self.rebase(from), self.rebase(to))
    }

    fn link(&self, from: &str, to: &str) -> io::Result<()> {
        std::fs::hard_link(self.rebase(from), self.rebase(to))
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        nix::sys::stat::fchmodat(
            None,
            &self.rebase(path),
            Mode::from_bits_truncate(mode),
            nix::sys::stat::FchmodatFlags::FollowSymlink,
        )
        .map_err(err)
    }

    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        nix::unistd::chown(
            &self.rebase(path),
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )
        .map_err(err)
    }

    fn access(&self, path: &str, mask: u32) -> io::Result<()> {
        nix::unistd::access(&self.rebase(path), AccessFlags::from_bits_truncate(mask as i32))
            .map_err(err)
    }

    fn statfs(&self, path: &str) -> io::Result<FsStats> {
        let st = nix::sys::statfs::statfs(&self.rebase(path)).map_err(err)?;
        Ok(FsStats {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            namelen: st.maximum_name_length() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real"), b"x").unwrap();
        let pass = DirPassthrough::new(dir.path()).unwrap();

        assert!(pass.exists("/real"));
        assert!(!pass.exists("/missing"));
        assert_eq!(pass.getattr("/real").unwrap().st_size, 1);
    }

    #[test]
    fn list_dir_excludes_dot_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        let pass = DirPassthrough::new(dir.path()).unwrap();

        let mut names = pass.list_dir("/").unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn open_read_write_release() {
        let dir = tempfile::tempdir().unwrap();
        let pass = DirPassthrough::new(dir.path()).unwrap();

        let fh = pass
            .create("/f", libc::O_RDWR, 0o644)
            .expect("create failed");
        assert_eq!(pass.write_at(fh, b"hyperfs", 0).unwrap(), 7);
        let mut buf = [0u8; 16];
        assert_eq!(pass.read_at(fh, &mut buf, 2).unwrap(), 5);
        assert_eq!(&buf[..5], b"perfs");
        pass.release(fh).unwrap();
    }

    #[test]
    fn missing_root_is_fatal() {
        assert!(DirPassthrough::new("/nonexistent-hyperfs-root").is_err());
    }
}

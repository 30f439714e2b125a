//! The `/dev/fuse` session: mounts the filesystem, resolves kernel node ids
//! back to paths, and drives one request/reply loop against the router.
//!
//! Single-threaded on purpose. Virtual operations block on the host anyway,
//! and heavy traffic belongs on the CUSE devices, which each have their own
//! worker.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::fd::FromRawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::Mode;
use tracing::{debug, info, warn};
use vm_memory::ByteValued;

use crate::fuse;
use crate::router::{Ctx, HyperFs};

const FUSE_DEV: &str = "/dev/fuse";
const MAX_WRITE: u32 = 131072;
const REQUEST_BUF: usize = MAX_WRITE as usize + 4096;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to open /dev/fuse: {0}")]
    OpenDevice(Errno),
    #[error("mount at {path}: {source}")]
    Mount { path: String, source: Errno },
    #[error("device io: {0}")]
    DeviceIo(#[from] io::Error),
    #[error("kernel speaks unsupported ABI {major}.{minor}")]
    AbiMismatch { major: u32, minor: u32 },
}

/// Kernel node id to path mapping, maintained from LOOKUP/FORGET traffic.
/// The root is permanent under id 1.
struct NodeTable {
    by_id: HashMap<u64, Node>,
    by_path: HashMap<String, u64>,
    next: u64,
}

struct Node {
    path: String,
    refs: u64,
}

impl NodeTable {
    fn new() -> Self {
        let mut t = Self {
            by_id: HashMap::new(),
            by_path: HashMap::new(),
            next: 2,
        };
        t.by_id.insert(
            fuse::ROOT_ID,
            Node {
                path: "/".to_string(),
                refs: 1,
            },
        );
        t.by_path.insert("/".to_string(), fuse::ROOT_ID);
        t
    }

    fn path_of(&self, id: u64) -> Option<String> {
        self.by_id.get(&id).map(|n| n.path.clone())
    }

    /// Register one kernel reference to `path`, minting an id on first use.
    fn acquire(&mut self, path: &str) -> u64 {
        if let Some(&id) = self.by_path.get(path) {
            if let Some(node) = self.by_id.get_mut(&id) {
                node.refs += 1;
            }
            return id;
        }
        let id = self.next;
        self.next += 1;
        self.by_id.insert(
            id,
            Node {
                path: path.to_string(),
                refs: 1,
            },
        );
        self.by_path.insert(path.to_string(), id);
        id
    }

    fn forget(&mut self, id: u64, nlookup: u64) {
        if id == fuse::ROOT_ID {
            return;
        }
        let Some(node) = self.by_id.get_mut(&id) else {
            return;
        };
        if node.refs > nlookup {
            node.refs -= nlookup;
            return;
        }
        let path = node.path.clone();
        self.by_id.remove(&id);
        self.by_path.remove(&path);
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(id) = self.by_path.remove(from) {
            if let Some(node) = self.by_id.get_mut(&id) {
                node.path = to.to_string();
            }
            self.by_path.insert(to.to_string(), id);
        }
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn first_cstr(body: &[u8]) -> Option<&str> {
    CStr::from_bytes_until_nul(body).ok()?.to_str().ok()
}

fn two_cstrs(body: &[u8]) -> Option<(&str, &str)> {
    let first = CStr::from_bytes_until_nul(body).ok()?;
    let rest = &body[first.to_bytes().len() + 1..];
    let second = CStr::from_bytes_until_nul(rest).ok()?;
    Some((first.to_str().ok()?, second.to_str().ok()?))
}

fn synth_ino(name: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    name.hash(&mut h);
    h.finish() | 1
}

/// Pack a listing into `fuse_dirent` records, skipping the first `offset`
/// entries and stopping before `max` bytes. Cookies are entry indices plus
/// one, so the kernel resumes exactly where a full buffer cut it off.
fn build_dirent_buf(listing: &[String], offset: u64, max: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    for (i, name) in listing.iter().enumerate().skip(offset as usize) {
        let entry_len = fuse::dirent_pad(name.len());
        if buf.len() + entry_len > max {
            break;
        }
        let dirent = fuse::Dirent {
            ino: synth_ino(name),
            off: (i + 1) as u64,
            namelen: name.len() as u32,
            typ: 0,
        };
        buf.extend_from_slice(dirent.as_slice());
        buf.extend_from_slice(name.as_bytes());
        buf.resize(buf.len() + entry_len - size_of::<fuse::Dirent>() - name.len(), 0);
    }
    buf
}

pub struct Session {
    fs: HyperFs,
    dev: File,
    mountpoint: String,
    nodes: NodeTable,
    mounted: bool,
}

impl Session {
    /// Open `/dev/fuse` and mount over `mountpoint`. The caller must be
    /// able to mount; this runs as guest init tooling, so that means root.
    pub fn mount(fs: HyperFs, mountpoint: &str) -> Result<Self, SessionError> {
        let fd = nix::fcntl::open(FUSE_DEV, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(SessionError::OpenDevice)?;
        let dev = unsafe { File::from_raw_fd(fd) };

        let data = format!("fd={fd},rootmode=40000,user_id=0,group_id=0,allow_other");
        mount(
            Some("hyperfs"),
            mountpoint,
            Some("fuse.hyperfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(data.as_str()),
        )
        .map_err(|source| SessionError::Mount {
            path: mountpoint.to_string(),
            source,
        })?;
        info!(mountpoint, "mounted");

        Ok(Self {
            fs,
            dev,
            mountpoint: mountpoint.to_string(),
            nodes: NodeTable::new(),
            mounted: true,
        })
    }

    /// Serve until unmount. A vanished connection is a clean shutdown;
    /// anything else is surfaced.
    pub fn run(&mut self) -> Result<(), SessionError> {
        let mut buf = vec![0u8; REQUEST_BUF];
        loop {
            let Some((hdr, body)) = fuse::read_request(&self.dev, &mut buf)? else {
                info!(mountpoint = %self.mountpoint, "connection closed, shutting down");
                self.mounted = false;
                return Ok(());
            };
            self.dispatch(&hdr, &body)?;
        }
    }

    fn reply(&self, unique: u64, payload: &[u8]) -> io::Result<()> {
        fuse::reply(&self.dev, unique, 0, payload)
    }

    fn reply_errno(&self, unique: u64, e: Errno) -> io::Result<()> {
        fuse::reply_err(&self.dev, unique, e as i32)
    }

    fn attr_out(attr: fuse::Attr) -> fuse::AttrOut {
        // Zero validity: virtual sizes change under the host's feet.
        fuse::AttrOut {
            attr,
            ..Default::default()
        }
    }

    fn entry_out(&mut self, path: &str, attr: fuse::Attr) -> fuse::EntryOut {
        fuse::EntryOut {
            nodeid: self.nodes.acquire(path),
            attr,
            ..Default::default()
        }
    }

    /// Look up the path for a request's node, or answer ESTALE.
    fn node_path(&self, hdr: &fuse::InHeader) -> Result<String, Errno> {
        self.nodes.path_of(hdr.nodeid).ok_or(Errno::ESTALE)
    }

    fn dispatch(&mut self, hdr: &fuse::InHeader, body: &[u8]) -> io::Result<()> {
        let ctx = Ctx {
            uid: hdr.uid,
            gid: hdr.gid,
            pid: hdr.pid,
        };
        let unique = hdr.unique;

        macro_rules! path_or_stale {
            () => {
                match self.node_path(hdr) {
                    Ok(p) => p,
                    Err(e) => return self.reply_errno(unique, e),
                }
            };
        }
        macro_rules! parse_or_eio {
            ($t:ty) => {
                match fuse::parse::<$t>(body) {
                    Some(v) => v,
                    None => return self.reply_errno(unique, Errno::EIO),
                }
            };
        }
        macro_rules! name_or_eio {
            () => {
                match first_cstr(body) {
                    Some(n) => n,
                    None => return self.reply_errno(unique, Errno::EIO),
                }
            };
        }

        match hdr.opcode {
            fuse::FUSE_INIT => {
                let req = parse_or_eio!(fuse::InitIn);
                if req.major != fuse::KERNEL_VERSION {
                    warn!(major = req.major, minor = req.minor, "kernel ABI mismatch");
                    return self.reply_errno(unique, Errno::EPROTO);
                }
                let out = fuse::InitOut {
                    major: fuse::KERNEL_VERSION,
                    minor: fuse::KERNEL_MINOR_VERSION.min(req.minor),
                    max_readahead: req.max_readahead,
                    flags: req.flags & fuse::FUSE_BIG_WRITES,
                    max_background: 16,
                    congestion_threshold: 12,
                    max_write: MAX_WRITE,
                    time_gran: 1,
                    ..Default::default()
                };
                debug!(minor = out.minor, "session initialized");
                self.reply(unique, out.as_slice())
            }
            fuse::FUSE_DESTROY => {
                self.mounted = false;
                self.reply(unique, &[])
            }
            fuse::FUSE_LOOKUP => {
                let parent = path_or_stale!();
                let name = name_or_eio!();
                let path = child_path(&parent, name);
                match self.fs.getattr(&path, &ctx) {
                    Ok(attr) => {
                        let out = self.entry_out(&path, attr);
                        self.reply(unique, out.as_slice())
                    }
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_FORGET => {
                if let Some(req) = fuse::parse::<fuse::ForgetIn>(body) {
                    self.nodes.forget(hdr.nodeid, req.nlookup);
                }
                Ok(())
            }
            fuse::FUSE_GETATTR => {
                let path = path_or_stale!();
                match self.fs.getattr(&path, &ctx) {
                    Ok(attr) => self.reply(unique, Self::attr_out(attr).as_slice()),
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_SETATTR => {
                let path = path_or_stale!();
                let req = parse_or_eio!(fuse::SetattrIn);
                match self.fs.setattr(&path, req.valid, &req, &ctx) {
                    Ok(attr) => self.reply(unique, Self::attr_out(attr).as_slice()),
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_READLINK => {
                let path = path_or_stale!();
                match self.fs.readlink(&path, &ctx) {
                    Ok(target) => self.reply(unique, target.as_bytes()),
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_OPEN => {
                let path = path_or_stale!();
                let req = parse_or_eio!(fuse::OpenIn);
                match self.fs.open(&path, req.flags as i32) {
                    Ok((fh, open_flags)) => {
                        let out = fuse::OpenOut {
                            fh,
                            open_flags,
                            ..Default::default()
                        };
                        self.reply(unique, out.as_slice())
                    }
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_OPENDIR => {
                let out = fuse::OpenOut::default();
                self.reply(unique, out.as_slice())
            }
            fuse::FUSE_READ => {
                let path = path_or_stale!();
                let req = parse_or_eio!(fuse::ReadIn);
                let mut data = vec![0u8; req.size.min(MAX_WRITE) as usize];
                match self.fs.read(&path, req.fh, &mut data, req.offset as i64) {
                    Ok(n) => self.reply(unique, &data[..n]),
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_WRITE => {
                let path = path_or_stale!();
                let req = parse_or_eio!(fuse::WriteIn);
                let data = &body[size_of::<fuse::WriteIn>()..];
                if data.len() < req.size as usize {
                    return self.reply_errno(unique, Errno::EIO);
                }
                match self
                    .fs
                    .write(&path, req.fh, &data[..req.size as usize], req.offset as i64)
                {
                    Ok(n) => {
                        let out = fuse::WriteOut {
                            size: n as u32,
                            ..Default::default()
                        };
                        self.reply(unique, out.as_slice())
                    }
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_READDIR => {
                let path = path_or_stale!();
                let req = parse_or_eio!(fuse::ReadIn);
                match self.fs.readdir(&path) {
                    Ok(listing) => {
                        let buf = build_dirent_buf(&listing, req.offset, req.size as usize);
                        self.reply(unique, &buf)
                    }
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_RELEASE => {
                let path = path_or_stale!();
                let req = parse_or_eio!(fuse::ReleaseIn);
                match self.fs.release(&path, req.fh) {
                    Ok(()) => self.reply(unique, &[]),
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_RELEASEDIR | fuse::FUSE_FSYNCDIR | fuse::FUSE_FLUSH => {
                self.reply(unique, &[])
            }
            fuse::FUSE_FSYNC => {
                let path = path_or_stale!();
                let req = parse_or_eio!(fuse::FsyncIn);
                match self.fs.fsync(&path, req.fh, req.fsync_flags & 1 != 0) {
                    Ok(()) => self.reply(unique, &[]),
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_ACCESS => {
                let path = path_or_stale!();
                let req = parse_or_eio!(fuse::AccessIn);
                match self.fs.access(&path, req.mask) {
                    Ok(()) => self.reply(unique, &[]),
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_STATFS => {
                match self.fs.passthrough().statfs("/") {
                    Ok(st) => {
                        let out = fuse::StatfsOut {
                            blocks: st.blocks,
                            bfree: st.bfree,
                            bavail: st.bavail,
                            files: st.files,
                            ffree: st.ffree,
                            bsize: st.bsize,
                            namelen: st.namelen,
                            frsize: st.bsize,
                            ..Default::default()
                        };
                        self.reply(unique, out.as_slice())
                    }
                    Err(e) => {
                        self.reply_errno(unique, Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
                    }
                }
            }
            fuse::FUSE_CREATE => {
                let parent = path_or_stale!();
                let req = parse_or_eio!(fuse::CreateIn);
                let name = match first_cstr(&body[size_of::<fuse::CreateIn>()..]) {
                    Some(n) => n,
                    None => return self.reply_errno(unique, Errno::EIO),
                };
                let path = child_path(&parent, name);
                let fh = match self.fs.create(&path, req.flags as i32, req.mode) {
                    Ok(fh) => fh,
                    Err(e) => return self.reply_errno(unique, e),
                };
                match self.fs.getattr(&path, &ctx) {
                    Ok(attr) => {
                        let entry = self.entry_out(&path, attr);
                        let open = fuse::OpenOut {
                            fh,
                            ..Default::default()
                        };
                        let mut payload = entry.as_slice().to_vec();
                        payload.extend_from_slice(open.as_slice());
                        self.reply(unique, &payload)
                    }
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_MKNOD => {
                let parent = path_or_stale!();
                let req = parse_or_eio!(fuse::MknodIn);
                let name = match first_cstr(&body[size_of::<fuse::MknodIn>()..]) {
                    Some(n) => n,
                    None => return self.reply_errno(unique, Errno::EIO),
                };
                let path = child_path(&parent, name);
                if let Err(e) = self.fs.passthrough().mknod(&path, req.mode, req.rdev as u64) {
                    return self.reply_errno(unique, Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)));
                }
                self.lookup_reply(unique, &path, &ctx)
            }
            fuse::FUSE_MKDIR => {
                let parent = path_or_stale!();
                let req = parse_or_eio!(fuse::MkdirIn);
                let name = match first_cstr(&body[size_of::<fuse::MkdirIn>()..]) {
                    Some(n) => n,
                    None => return self.reply_errno(unique, Errno::EIO),
                };
                let path = child_path(&parent, name);
                if let Err(e) = self.fs.passthrough().mkdir(&path, req.mode) {
                    return self.reply_errno(unique, Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)));
                }
                self.lookup_reply(unique, &path, &ctx)
            }
            fuse::FUSE_SYMLINK => {
                let parent = path_or_stale!();
                let Some((name, target)) = two_cstrs(body) else {
                    return self.reply_errno(unique, Errno::EIO);
                };
                let path = child_path(&parent, name);
                if let Err(e) = self.fs.passthrough().symlink(target, &path) {
                    return self.reply_errno(unique, Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)));
                }
                self.lookup_reply(unique, &path, &ctx)
            }
            fuse::FUSE_UNLINK => {
                let parent = path_or_stale!();
                let name = name_or_eio!();
                let path = child_path(&parent, name);
                match self.fs.passthrough().unlink(&path) {
                    Ok(()) => self.reply(unique, &[]),
                    Err(e) => self.reply_errno(unique, Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))),
                }
            }
            fuse::FUSE_RMDIR => {
                let parent = path_or_stale!();
                let name = name_or_eio!();
                let path = child_path(&parent, name);
                match self.fs.passthrough().rmdir(&path) {
                    Ok(()) => self.reply(unique, &[]),
                    Err(e) => self.reply_errno(unique, Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))),
                }
            }
            fuse::FUSE_RENAME | fuse::FUSE_RENAME2 => {
                let parent = path_or_stale!();
                let (newdir, names) = if hdr.opcode == fuse::FUSE_RENAME2 {
                    let req = parse_or_eio!(fuse::Rename2In);
                    if req.flags != 0 {
                        return self.reply_errno(unique, Errno::EINVAL);
                    }
                    (req.newdir, &body[size_of::<fuse::Rename2In>()..])
                } else {
                    let req = parse_or_eio!(fuse::RenameIn);
                    (req.newdir, &body[size_of::<fuse::RenameIn>()..])
                };
                let Some(newparent) = self.nodes.path_of(newdir) else {
                    return self.reply_errno(unique, Errno::ESTALE);
                };
                let Some((old, new)) = two_cstrs(names) else {
                    return self.reply_errno(unique, Errno::EIO);
                };
                let from = child_path(&parent, old);
                let to = child_path(&newparent, new);
                match self.fs.passthrough().rename(&from, &to) {
                    Ok(()) => {
                        self.nodes.rename(&from, &to);
                        self.reply(unique, &[])
                    }
                    Err(e) => self.reply_errno(unique, Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))),
                }
            }
            fuse::FUSE_LINK => {
                let parent = path_or_stale!();
                let req = parse_or_eio!(fuse::LinkIn);
                let name = match first_cstr(&body[size_of::<fuse::LinkIn>()..]) {
                    Some(n) => n,
                    None => return self.reply_errno(unique, Errno::EIO),
                };
                let Some(old) = self.nodes.path_of(req.oldnodeid) else {
                    return self.reply_errno(unique, Errno::ESTALE);
                };
                let path = child_path(&parent, name);
                if let Err(e) = self.fs.passthrough().link(&old, &path) {
                    return self.reply_errno(unique, Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)));
                }
                self.lookup_reply(unique, &path, &ctx)
            }
            fuse::FUSE_IOCTL => {
                let path = path_or_stale!();
                let req = parse_or_eio!(fuse::IoctlIn);
                match self.fs.ioctl(&path, req.fh, req.cmd, req.arg) {
                    Ok(result) => {
                        let out = fuse::IoctlOut {
                            result,
                            ..Default::default()
                        };
                        let mut payload = out.as_slice().to_vec();
                        // The host writes any out-of-band data through the
                        // argument pointer itself; the kernel still expects
                        // out_size bytes inline.
                        payload.resize(payload.len() + req.out_size as usize, 0);
                        self.reply(unique, &payload)
                    }
                    Err(e) => self.reply_errno(unique, e),
                }
            }
            fuse::FUSE_INTERRUPT => Ok(()),
            op => {
                debug!(op, "unsupported opcode");
                self.reply_errno(unique, Errno::ENOSYS)
            }
        }
    }

    fn lookup_reply(&mut self, unique: u64, path: &str, ctx: &Ctx) -> io::Result<()> {
        match self.fs.getattr(path, ctx) {
            Ok(attr) => {
                let out = self.entry_out(path, attr);
                self.reply(unique, out.as_slice())
            }
            Err(e) => self.reply_errno(unique, e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = umount2(self.mountpoint.as_str(), MntFlags::MNT_DETACH) {
                warn!(mountpoint = %self.mountpoint, error = %e, "unmount failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_table_tracks_lookups_and_forgets() {
        let mut t = NodeTable::new();
        assert_eq!(t.path_of(fuse::ROOT_ID).as_deref(), Some("/"));

        let id = t.acquire("/a");
        assert_eq!(t.acquire("/a"), id);
        assert_eq!(t.path_of(id).as_deref(), Some("/a"));

        t.forget(id, 1);
        assert_eq!(t.path_of(id).as_deref(), Some("/a"));
        t.forget(id, 1);
        assert_eq!(t.path_of(id), None);

        // A fresh lookup gets a new id.
        assert_ne!(t.acquire("/a"), id);
    }

    #[test]
    fn root_survives_forget() {
        let mut t = NodeTable::new();
        t.forget(fuse::ROOT_ID, 100);
        assert_eq!(t.path_of(fuse::ROOT_ID).as_deref(), Some("/"));
    }

    #[test]
    fn rename_moves_the_mapping() {
        let mut t = NodeTable::new();
        let id = t.acquire("/old");
        t.rename("/old", "/new");
        assert_eq!(t.path_of(id).as_deref(), Some("/new"));
        assert_eq!(t.acquire("/new"), id);
    }

    #[test]
    fn child_paths_join_without_double_slash() {
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/dir", "a"), "/dir/a");
    }

    #[test]
    fn cstr_parsing() {
        assert_eq!(first_cstr(b"name\0"), Some("name"));
        assert_eq!(first_cstr(b"no-nul"), None);
        assert_eq!(two_cstrs(b"old\0new\0"), Some(("old", "new")));
        assert_eq!(two_cstrs(b"only\0"), None);
    }

    #[test]
    fn dirent_buffer_respects_offset_and_size() {
        let listing: Vec<String> = ["the-first", "second", "third"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let all = build_dirent_buf(&listing, 0, 4096);
        let expected: usize = listing.iter().map(|n| fuse::dirent_pad(n.len())).sum();
        assert_eq!(all.len(), expected);

        // Resuming at cookie 1 skips the first entry.
        let rest = build_dirent_buf(&listing, 1, 4096);
        let d: fuse::Dirent = fuse::parse(&rest).unwrap();
        assert_eq!(d.namelen as usize, "second".len());
        assert_eq!(d.off, 2);

        // A tight size bound truncates at an entry boundary.
        let tight = build_dirent_buf(&listing, 0, fuse::dirent_pad("the-first".len()));
        assert_eq!(tight.len(), fuse::dirent_pad("the-first".len()));
    }

    #[test]
    fn dirent_inodes_are_never_zero() {
        let listing = vec![String::new(), "x".to_string()];
        let buf = build_dirent_buf(&listing, 0, 4096);
        let d: fuse::Dirent = fuse::parse(&buf).unwrap();
        assert_ne!(d.ino, 0);
    }
}

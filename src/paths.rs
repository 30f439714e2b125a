//! The set of hypervisor-designated virtual paths, and classification of
//! arbitrary paths against it. Loaded once at startup, read-only afterwards;
//! classification is a pure function of the set and the queried path.

use std::ffi::{c_void, CStr};

use nix::errno::Errno;
use tracing::debug;

use crate::bridge::touch_bytes;
use crate::hypercall::{HypercallPort, HC_GET_HYPERFILE_PATHS, HC_GET_NUM_HYPERFILES};
use crate::wire::HYPERFILE_PATH_MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Exact match of a virtual file.
    Device,
    /// `/` or a strict ancestor of at least one entry: an implied directory.
    DirectoryPrefix,
    /// Must be delegated to the passthrough collaborator.
    NotVirtual,
}

#[derive(Debug, thiserror::Error)]
pub enum PathSetError {
    #[error("hyperfile path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("duplicate hyperfile path: {0}")]
    Duplicate(String),
    #[error("hyperfile path is not valid UTF-8")]
    BadEncoding,
    #[error("host refused discovery: {0}")]
    Host(Errno),
}

/// Ordered, unique set of absolute virtual paths.
#[derive(Debug, Default)]
pub struct HyperPathSet {
    paths: Vec<String>,
}

impl HyperPathSet {
    pub fn new(paths: impl IntoIterator<Item = String>) -> Result<Self, PathSetError> {
        let mut out: Vec<String> = Vec::new();
        for p in paths {
            if !p.starts_with('/') || p.len() < 2 || p.ends_with('/') {
                return Err(PathSetError::NotAbsolute(p));
            }
            if out.iter().any(|q| *q == p) {
                return Err(PathSetError::Duplicate(p));
            }
            out.push(p);
        }
        Ok(Self { paths: out })
    }

    /// Parse a colon-separated startup list. Empty segments are ignored so a
    /// trailing `:` is harmless.
    pub fn from_list(list: &str) -> Result<Self, PathSetError> {
        Self::new(list.split(':').filter(|s| !s.is_empty()).map(String::from))
    }

    /// Fetch the set from the host: one call for the count, one filling an
    /// array of fixed-size NUL-terminated path buffers.
    pub fn discover(port: &dyn HypercallPort) -> Result<Self, PathSetError> {
        let mut count: u64 = 0;
        unsafe { std::ptr::read_volatile(&count) };
        let ret = port.call(
            HC_GET_NUM_HYPERFILES,
            &mut [&mut count as *mut u64 as *mut c_void],
        );
        if ret < 0 {
            return Err(PathSetError::Host(Errno::from_raw(-ret as i32)));
        }

        let mut bufs = vec![[0u8; HYPERFILE_PATH_MAX]; count as usize];
        for buf in &mut bufs {
            touch_bytes(&buf[..]);
        }
        let mut ptrs: Vec<*mut c_void> = bufs
            .iter_mut()
            .map(|b| b.as_mut_ptr() as *mut c_void)
            .collect();
        let ret = port.call(HC_GET_HYPERFILE_PATHS, &mut ptrs);
        if ret < 0 {
            return Err(PathSetError::Host(Errno::from_raw(-ret as i32)));
        }

        let mut paths = Vec::with_capacity(bufs.len());
        for buf in &bufs {
            let cstr = CStr::from_bytes_until_nul(buf).map_err(|_| PathSetError::BadEncoding)?;
            let s = cstr.to_str().map_err(|_| PathSetError::BadEncoding)?;
            paths.push(s.to_string());
        }
        debug!(?paths, "discovered hyperfile paths");
        Self::new(paths)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Classify `path` against every entry. Exact match wins over prefix
    /// match; no match at all means passthrough.
    pub fn classify(&self, path: &str) -> PathClass {
        let mut class = PathClass::NotVirtual;
        for entry in &self.paths {
            if path == entry {
                return PathClass::Device;
            }
            if path == "/" || is_dir_prefix(path, entry) {
                class = PathClass::DirectoryPrefix;
            }
        }
        class
    }

    /// Immediate child segments of `dir` implied by the set, deduplicated:
    /// two entries sharing a child segment contribute it once.
    pub fn children_of(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" { "" } else { dir };
        let mut children: Vec<String> = Vec::new();
        for entry in &self.paths {
            let Some(rest) = entry.strip_prefix(prefix) else {
                continue;
            };
            let Some(rest) = rest.strip_prefix('/') else {
                continue;
            };
            let segment = match rest.split_once('/') {
                Some((first, _)) => first,
                None => rest,
            };
            if !segment.is_empty() && !children.iter().any(|c| c == segment) {
                children.push(segment.to_string());
            }
        }
        children
    }
}

fn is_dir_prefix(path: &str, entry: &str) -> bool {
    entry.len() > path.len()
        && entry.starts_with(path)
        && entry.as_bytes()[path.len()] == b'/'
}

//! Fixed-layout records passed by pointer through the trap. The host-side
//! decoder reads these bit-for-bit out of guest memory; field order and
//! packing must never change independently on either side.

use vm_memory::ByteValued;

/// Bound on a single discovered path entry, including the NUL terminator.
pub const HYPERFILE_PATH_MAX: usize = 1024;

/// Operation tag in [`OpHeader::op`].
pub const OP_READ: u32 = 0;
pub const OP_WRITE: u32 = 1;
pub const OP_IOCTL: u32 = 2;
pub const OP_GETATTR: u32 = 3;

/// Common prefix of every file-op record. The path is passed by reference,
/// not copied: `path_ptr`/`path_len` point at guest memory the bridge has
/// already paged in.
#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct OpHeader {
    pub op: u32,
    pub path_ptr: u64,
    pub path_len: u64,
}

unsafe impl ByteValued for OpHeader {}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ReadMsg {
    pub hdr: OpHeader,
    pub buf_ptr: u64,
    pub len: u64,
    pub offset: i64,
}

unsafe impl ByteValued for ReadMsg {}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct WriteMsg {
    pub hdr: OpHeader,
    pub buf_ptr: u64,
    pub len: u64,
    pub offset: i64,
}

unsafe impl ByteValued for WriteMsg {}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct IoctlMsg {
    pub hdr: OpHeader,
    pub cmd: u32,
    pub arg: u64,
}

unsafe impl ByteValued for IoctlMsg {}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetAttrMsg {
    pub hdr: OpHeader,
    /// Guest address of an `i64` the host fills with the file size.
    pub size_ptr: u64,
}

unsafe impl ByteValued for GetAttrMsg {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    // Packing is ABI: sizes must equal the sum of field sizes.
    #[test]
    fn layout_is_packed() {
        assert_eq!(size_of::<OpHeader>(), 20);
        assert_eq!(size_of::<ReadMsg>(), 44);
        assert_eq!(size_of::<WriteMsg>(), 44);
        assert_eq!(size_of::<IoctlMsg>(), 32);
        assert_eq!(size_of::<GetAttrMsg>(), 28);
    }

    #[test]
    fn header_leads_every_record() {
        let msg = ReadMsg {
            hdr: OpHeader {
                op: OP_READ,
                path_ptr: 0x1122_3344_5566_7788,
                path_len: 11,
            },
            ..Default::default()
        };
        let bytes = msg.as_slice();
        assert_eq!(&bytes[0..4], &OP_READ.to_ne_bytes());
        assert_eq!(&bytes[4..12], &0x1122_3344_5566_7788u64.to_ne_bytes());
        assert_eq!(&bytes[12..20], &11u64.to_ne_bytes());
    }
}

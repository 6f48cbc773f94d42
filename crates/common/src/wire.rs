//! Fixed-layout message frames carried by the ring queues.
//!
//! Every frame is a packed header followed by a type-specific body, laid out
//! contiguously in the ring slot. String fields are NUL-terminated within a
//! fixed capacity; variable payloads (frame data, subscription request text)
//! are size-prefixed tails after the body struct.
//!
//! The `status` byte inside the header is a per-message atomic used for
//! request/response correlation. It is written by exactly one side: the
//! requester publishes it as `Pending`, the responder transitions it to
//! `Success` or `Failed` exactly once, after all response fields are in
//! place. Ring visibility is the queue's job, not this field's.

use std::mem;
use std::slice;
use std::sync::atomic::{AtomicU8, Ordering};

/// Client name capacity.
pub const MAX_NAME: usize = 32;
/// Endpoint URL capacity.
pub const MAX_URL: usize = 512;
/// Credential key capacity.
pub const MAX_KEY: usize = 512;
/// Symbol capacity.
pub const MAX_SYMBOL: usize = 256;
/// Diagnostic text capacity.
pub const MAX_ERR: usize = 256;

/// Channel bitmask values for subscriptions.
pub mod channels {
    pub const NONE: u8 = 0;
    pub const QUOTES: u8 = 1;
    pub const TRADES: u8 = 1 << 1;
}

/// Message type tags. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Register = 0,
    Unregister = 1,
    OpenWs = 2,
    CloseWs = 3,
    Heartbeat = 4,
    WsRequest = 5,
    WsData = 6,
    WsError = 7,
    Subscribe = 8,
    Unsubscribe = 9,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => MsgType::Register,
            1 => MsgType::Unregister,
            2 => MsgType::OpenWs,
            3 => MsgType::CloseWs,
            4 => MsgType::Heartbeat,
            5 => MsgType::WsRequest,
            6 => MsgType::WsData,
            7 => MsgType::WsError,
            8 => MsgType::Subscribe,
            9 => MsgType::Unsubscribe,
            _ => return None,
        })
    }
}

/// Request/response correlation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Pending = 0,
    Success = 1,
    Failed = 2,
}

impl From<u8> for Status {
    fn from(v: u8) -> Self {
        match v {
            1 => Status::Success,
            2 => Status::Failed,
            _ => Status::Pending,
        }
    }
}

/// Frame header: originator PID, type tag, status word.
#[repr(C, packed)]
pub struct MsgHeader {
    pub pid: u64,
    pub msg_type: u8,
    pub status: u8,
}

/// Header length in bytes; the body starts right after.
pub const HEADER_LEN: usize = mem::size_of::<MsgHeader>();

impl MsgHeader {
    pub fn status(&self) -> Status {
        // `status` sits in a `repr(packed)` struct, so it may be
        // under-aligned for `AtomicU8` (whose alignment is asserted by the
        // compiler even though it is 1); go through a raw pointer to avoid
        // ever forming a `&AtomicU8` reference to unaligned memory.
        let ptr = &self.status as *const u8 as *mut u8;
        let status = unsafe { AtomicU8::from_ptr(ptr) };
        Status::from(status.load(Ordering::Acquire))
    }

    /// Release-store the response status. Response fields must already be
    /// written; the requester's acquire load pairs with this store.
    pub fn set_status(&self, status: Status) {
        let ptr = &self.status as *const u8 as *mut u8;
        let atomic = unsafe { AtomicU8::from_ptr(ptr) };
        atomic.store(status as u8, Ordering::Release);
    }

    pub fn type_tag(&self) -> Option<MsgType> {
        MsgType::from_u8(self.msg_type)
    }
}

#[repr(C, packed)]
pub struct RegisterBody {
    pub name: [u8; MAX_NAME],
    // response
    pub server_pid: u64,
    pub err: [u8; MAX_ERR],
}

#[repr(C, packed)]
pub struct OpenWsBody {
    pub url: [u8; MAX_URL],
    pub key: [u8; MAX_KEY],
    // response
    pub client_pid: u64,
    pub id: u64,
    pub new_connection: u8,
    pub err: [u8; MAX_ERR],
}

#[repr(C, packed)]
pub struct CloseWsBody {
    pub id: u64,
}

/// Subscribe/Unsubscribe body; the upstream request text follows as a tail
/// of `request_len` bytes.
#[repr(C, packed)]
pub struct SubscribeBody {
    pub symbol: [u8; MAX_SYMBOL],
    pub id: u64,
    pub request_len: u32,
    // response: set when the broker did not need to forward upstream
    pub existing: u8,
    pub channels: u8,
}

/// Raw bytes for the upstream socket; `len` bytes of tail follow.
#[repr(C, packed)]
pub struct WsRequestBody {
    pub id: u64,
    pub len: u32,
}

/// Error report from the upstream driver; `len` bytes of tail follow.
#[repr(C, packed)]
pub struct WsErrorBody {
    pub id: u64,
    pub len: u32,
}

/// Upstream frame payload; `len` bytes of tail follow. `remaining > 0`
/// flags a fragmented upstream frame whose continuation is forthcoming.
#[repr(C, packed)]
pub struct WsDataBody {
    pub id: u64,
    pub len: u32,
    pub remaining: u32,
}

// The numeric layout is the wire contract; hold it in place.
const _: () = assert!(HEADER_LEN == 10);
const _: () = assert!(mem::size_of::<RegisterBody>() == 296);
const _: () = assert!(mem::size_of::<OpenWsBody>() == 1297);
const _: () = assert!(mem::size_of::<CloseWsBody>() == 8);
const _: () = assert!(mem::size_of::<SubscribeBody>() == 270);
const _: () = assert!(mem::size_of::<WsRequestBody>() == 12);
const _: () = assert!(mem::size_of::<WsErrorBody>() == 12);
const _: () = assert!(mem::size_of::<WsDataBody>() == 16);

/// Total frame size for a body type plus a variable tail.
pub const fn message_size<T>(tail: usize) -> u32 {
    (HEADER_LEN + mem::size_of::<T>() + tail) as u32
}

/// Frame size for a bare header (Heartbeat, Unregister).
pub const BARE_MESSAGE_SIZE: u32 = HEADER_LEN as u32;

/// Zero a freshly reserved slot and stamp the header. Status starts out
/// `Pending` (zero).
///
/// # Safety
/// `ptr` must point at a writable slot of at least `size` bytes.
pub unsafe fn init_message(ptr: *mut u8, size: u32, pid: u64, msg_type: MsgType) {
    std::ptr::write_bytes(ptr, 0, size as usize);
    let hdr = &mut *(ptr as *mut MsgHeader);
    hdr.pid = pid;
    hdr.msg_type = msg_type as u8;
}

/// View the header of a frame in place.
///
/// # Safety
/// `ptr` must point at a frame of at least [`HEADER_LEN`] bytes that stays
/// mapped for `'a`.
pub unsafe fn header<'a>(ptr: *mut u8) -> &'a MsgHeader {
    &*(ptr as *const MsgHeader)
}

/// View the body of a frame in place.
///
/// # Safety
/// The frame at `ptr` must carry a `T` body and stay mapped for `'a`.
pub unsafe fn body<'a, T>(ptr: *mut u8) -> &'a T {
    &*(ptr.add(HEADER_LEN) as *const T)
}

/// Mutable view of the body of a frame in place.
///
/// # Safety
/// As [`body`], plus exclusive write access to the response fields.
#[allow(clippy::mut_from_ref)]
pub unsafe fn body_mut<'a, T>(ptr: *mut u8) -> &'a mut T {
    &mut *(ptr.add(HEADER_LEN) as *mut T)
}

/// The size-prefixed tail following a body struct.
///
/// # Safety
/// The frame must carry at least `len` tail bytes after its `T` body.
pub unsafe fn tail<'a, T>(ptr: *mut u8, len: u32) -> &'a [u8] {
    let p = ptr.add(HEADER_LEN + mem::size_of::<T>());
    slice::from_raw_parts(p, len as usize)
}

/// Mutable tail view, for writers filling a reserved slot.
///
/// # Safety
/// As [`tail`], plus exclusive write access.
pub unsafe fn tail_mut<'a, T>(ptr: *mut u8, len: u32) -> &'a mut [u8] {
    let p = ptr.add(HEADER_LEN + mem::size_of::<T>());
    slice::from_raw_parts_mut(p, len as usize)
}

/// Copy `s` into a fixed-capacity field, NUL-terminated, truncating on a
/// character boundary if it does not fit.
pub fn write_str(dst: &mut [u8], s: &str) {
    let mut n = s.len().min(dst.len() - 1);
    while n > 0 && !s.is_char_boundary(n) {
        n -= 1;
    }
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
    for b in &mut dst[n..] {
        *b = 0;
    }
}

/// Read a NUL-terminated fixed-capacity field back out.
pub fn read_str(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_strings_round_trip() {
        let mut buf = [0xFFu8; MAX_NAME];
        write_str(&mut buf, "quote-feed");
        assert_eq!(read_str(&buf), "quote-feed");
        // Everything past the NUL is cleared.
        assert!(buf[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn overlong_strings_truncate_on_char_boundary() {
        let mut buf = [0u8; 8];
        write_str(&mut buf, "abcdéfgh");
        let s = read_str(&buf);
        assert!(s.len() <= 7);
        assert!("abcdéfgh".starts_with(&s));
    }

    #[test]
    fn init_message_stamps_header_and_pending_status() {
        let size = message_size::<CloseWsBody>(0);
        let mut slot = vec![0xAAu8; size as usize];
        unsafe {
            init_message(slot.as_mut_ptr(), size, 42, MsgType::CloseWs);
            let hdr = header(slot.as_mut_ptr());
            assert_eq!({ hdr.pid }, 42);
            assert_eq!(hdr.type_tag(), Some(MsgType::CloseWs));
            assert_eq!(hdr.status(), Status::Pending);
            hdr.set_status(Status::Success);
            assert_eq!(hdr.status(), Status::Success);
        }
    }

    #[test]
    fn tails_follow_the_body() {
        let size = message_size::<WsDataBody>(5);
        let mut slot = vec![0u8; size as usize];
        unsafe {
            init_message(slot.as_mut_ptr(), size, 7, MsgType::WsData);
            let data = body_mut::<WsDataBody>(slot.as_mut_ptr());
            data.id = 99;
            data.len = 5;
            tail_mut::<WsDataBody>(slot.as_mut_ptr(), 5).copy_from_slice(b"hi\nok");
            let read_back = body::<WsDataBody>(slot.as_mut_ptr());
            assert_eq!({ read_back.id }, 99);
            assert_eq!(tail::<WsDataBody>(slot.as_mut_ptr(), 5), b"hi\nok");
        }
    }

    #[test]
    fn type_tags_match_the_wire_contract() {
        assert_eq!(MsgType::Register as u8, 0);
        assert_eq!(MsgType::Unsubscribe as u8, 9);
        assert_eq!(MsgType::from_u8(6), Some(MsgType::WsData));
        assert_eq!(MsgType::from_u8(10), None);
    }
}

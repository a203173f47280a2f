//! Native libraop adapter
//!
//! Thin unsafe shim over the `raopcl_*` C API. Only compiled with the
//! `libraop` feature, which links against the system library. All pointer
//! handling stays inside this file; the rest of the crate sees the
//! [`RaopClient`] trait only.

use std::ffi::CString;
use std::net::Ipv4Addr;
use std::ptr;

use libc::{c_char, c_float, c_int};

use super::client::{ClientParams, Crypto, RaopClient, RaopClientFactory};

#[allow(non_camel_case_types)]
#[repr(C)]
struct raopcl_s {
    _private: [u8; 0],
}

const RAOP_CLEAR: c_int = 0;
const RAOP_RSA: c_int = 1;
const RAOP_ALAC: c_int = 1;

/// Session latency requested from the library, in frames (0.5 s at 44.1 kHz).
const LATENCY_FRAMES: c_int = 22_050;

#[link(name = "raop")]
extern "C" {
    #[allow(clippy::too_many_arguments)]
    fn raopcl_create(
        local: libc::in_addr,
        rtsp_port: u16,
        udp_port: u16,
        dacp_id: *const c_char,
        active_remote: *const c_char,
        codec: c_int,
        frame_len: c_int,
        latency_frames: c_int,
        crypto: c_int,
        auth: bool,
        password: *const c_char,
        secret: *const c_char,
        et: *const c_char,
        md: *const c_char,
        sample_rate: c_int,
        sample_size: c_int,
        channels: c_int,
        volume: c_float,
    ) -> *mut raopcl_s;
    fn raopcl_connect(p: *mut raopcl_s, host: libc::in_addr, destport: u16, set_volume: bool)
        -> bool;
    fn raopcl_disconnect(p: *mut raopcl_s) -> bool;
    fn raopcl_destroy(p: *mut raopcl_s) -> bool;
    fn raopcl_keepalive(p: *mut raopcl_s) -> bool;
    fn raopcl_accept_frames(p: *mut raopcl_s) -> bool;
    fn raopcl_send_chunk(p: *mut raopcl_s, sample: *const u8, frames: c_int, playtime: *mut u64)
        -> bool;
    fn raopcl_set_volume(p: *mut raopcl_s, volume: c_float) -> bool;
}

fn to_in_addr(ip: Ipv4Addr) -> libc::in_addr {
    // Octets are already in network byte order.
    libc::in_addr {
        s_addr: u32::from_ne_bytes(ip.octets()),
    }
}

/// Creates [`LibraopClient`] sessions.
pub struct LibraopFactory;

impl RaopClientFactory for LibraopFactory {
    fn create(&self, params: &ClientParams) -> Option<Box<dyn RaopClient>> {
        let et = params
            .et
            .as_deref()
            .and_then(|et| CString::new(et).ok());
        let et_ptr = et.as_ref().map_or(ptr::null(), |s| s.as_ptr());

        let crypto = match params.crypto {
            Crypto::Clear => RAOP_CLEAR,
            Crypto::Rsa => RAOP_RSA,
        };

        let local = libc::in_addr {
            s_addr: libc::INADDR_ANY,
        };

        let raw = unsafe {
            raopcl_create(
                local,
                0,
                0,
                ptr::null(),
                ptr::null(),
                RAOP_ALAC,
                params.frames_per_chunk as c_int,
                LATENCY_FRAMES,
                crypto,
                params.auth,
                ptr::null(),
                ptr::null(),
                et_ptr,
                ptr::null(),
                params.sample_rate as c_int,
                params.sample_size as c_int,
                params.channels as c_int,
                0.0,
            )
        };

        if raw.is_null() {
            tracing::warn!(target: "libraop", "raopcl_create returned null");
            return None;
        }

        Some(Box::new(LibraopClient {
            raw,
            // Keep the et string alive for the client's lifetime; the
            // library holds the pointer.
            _et: et,
        }))
    }
}

/// One native libraop session. The raw handle is owned exclusively by this
/// value and destroyed on drop.
pub struct LibraopClient {
    raw: *mut raopcl_s,
    _et: Option<CString>,
}

// The library serializes access internally per handle; the handle is only
// ever used behind the hostage mutex anyway.
unsafe impl Send for LibraopClient {}

impl RaopClient for LibraopClient {
    fn connect(&mut self, host: Ipv4Addr, port: u16, set_volume: bool) -> bool {
        unsafe { raopcl_connect(self.raw, to_in_addr(host), port, set_volume) }
    }

    fn disconnect(&mut self) {
        unsafe {
            raopcl_disconnect(self.raw);
        }
    }

    fn keepalive(&mut self) -> bool {
        unsafe { raopcl_keepalive(self.raw) }
    }

    fn accept_frames(&mut self) -> bool {
        unsafe { raopcl_accept_frames(self.raw) }
    }

    fn send_chunk(&mut self, pcm: &[u8], frames: usize, playtime: &mut u64) -> bool {
        unsafe { raopcl_send_chunk(self.raw, pcm.as_ptr(), frames as c_int, playtime) }
    }

    fn set_volume(&mut self, volume: f32) -> bool {
        unsafe { raopcl_set_volume(self.raw, volume) }
    }
}

impl Drop for LibraopClient {
    fn drop(&mut self) {
        unsafe {
            raopcl_destroy(self.raw);
        }
    }
}

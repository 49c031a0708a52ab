//! Registration of connectionless `AF_UNIX`/`SOCK_DGRAM` sockets with the reactor.
//!
//! [`Io`](crate::Io) only ever talks to a single, already-connected peer. The application-facing
//! IPC socket instead serves many clients over one socket, so every read and write needs to carry
//! a peer address alongside the payload.

use std::ffi::OsStr;
use std::mem::{size_of, zeroed};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use collections::bytes::{Cursor, Slice};
use libc::{c_void, sockaddr, sockaddr_un, socklen_t, AF_UNIX};
use log::error;
use stakker::Fwd;
use utils::error::*;

use crate::{as_raw, ret_to_err, Entry, Kind, Poll, Queued, State, POLLIN, POLLOUT};

/// The filesystem path a client's datagram socket is bound to.
///
/// `std::os::unix::net::SocketAddr` isn't `Clone`, so replies are addressed by this instead.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientAddr(PathBuf);

impl ClientAddr {
	pub fn path(&self) -> &Path {
		&self.0
	}
}

impl From<&Path> for ClientAddr {
	fn from(path: &Path) -> Self {
		Self(path.to_path_buf())
	}
}

/// Offset of `sun_path` within `sockaddr_un`, computed rather than hardcoded since padding differs by platform.
fn sun_path_offset() -> usize {
	let base = core::mem::MaybeUninit::<sockaddr_un>::uninit();
	let base_ptr = base.as_ptr();

	unsafe {
		let path_ptr = std::ptr::addr_of!((*base_ptr).sun_path);
		(path_ptr as usize) - (base_ptr as usize)
	}
}

fn addr_from_raw(addr: &sockaddr_un, len: socklen_t) -> Option<ClientAddr> {
	let len = len as usize;
	let offset = sun_path_offset();

	if len <= offset {
		// An unnamed (unbound) socket. We have no address to reply to.
		return None;
	}

	let path_len = len - offset;
	let bytes = unsafe { std::slice::from_raw_parts(addr.sun_path.as_ptr() as *const u8, path_len) };
	let bytes = match bytes.iter().position(|&b| b == 0) {
		Some(n) => &bytes[..n],
		None => bytes,
	};

	if bytes.is_empty() {
		return None;
	}

	Some(ClientAddr(PathBuf::from(OsStr::from_bytes(bytes))))
}

fn addr_to_raw(addr: &ClientAddr) -> Result<(sockaddr_un, socklen_t)> {
	let bytes = addr.0.as_os_str().as_bytes();
	let mut raw: sockaddr_un = unsafe { zeroed() };

	if bytes.len() >= raw.sun_path.len() {
		error!("Client socket path too long: {:?}", addr.0);
		return Err(());
	}

	raw.sun_family = AF_UNIX as _;

	for (dst, &src) in raw.sun_path.iter_mut().zip(bytes) {
		*dst = src as _;
	}

	let len = sun_path_offset() + bytes.len();
	Ok((raw, len as socklen_t))
}

pub(crate) fn recvfrom(fd: RawFd, buf: &mut Slice) -> Result<Option<ClientAddr>> {
	let mut raw: sockaddr_un = unsafe { zeroed() };
	let mut len: socklen_t = size_of::<sockaddr_un>() as _;

	let r = unsafe {
		libc::recvfrom(
			fd,
			buf.as_mut_ptr() as *mut c_void,
			buf.len() as _,
			0,
			&mut raw as *mut sockaddr_un as *mut sockaddr,
			&mut len,
		)
	};

	let Some(n) = ret_to_err(r as _)? else { return Ok(None) };

	buf.truncate(n);

	let Some(addr) = addr_from_raw(&raw, len) else {
		error!("Dropping datagram from an unbound client socket");
		return Ok(None);
	};

	Ok(Some(addr))
}

pub(crate) fn sendto(fd: RawFd, buf: &[u8], addr: &ClientAddr) -> Result<bool> {
	let (raw, len) = addr_to_raw(addr)?;

	let r = unsafe { libc::sendto(fd, buf.as_ptr() as *const c_void, buf.len() as _, 0, &raw as *const sockaddr_un as *const sockaddr, len) };

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to {:?}", n, buf.len(), addr.0);
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

/// A registered connectionless `AF_UNIX` datagram socket.
pub struct DgramIo<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> DgramIo<T> {
	pub fn new(inner: T, fwd: Fwd<(Slice, ClientAddr)>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { kind: Kind::Dgram(fwd), queue: Default::default() });

			Self { inner }
		})
	}

	/// Build and send a datagram to `addr`, queuing it if the socket buffer is currently full.
	pub fn write<X>(&self, addr: &ClientAddr, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		if !sendto(as_raw(&self.inner), &vec, addr)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front(Queued::Dgram(vec.into_boxed_slice(), addr.clone()));
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(res)
	}
}

impl<T: AsRawFd> Drop for DgramIo<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}

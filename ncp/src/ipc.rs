//! The application-facing local datagram wire format (§4.6): a one-byte opcode, fixed fields, and
//! a variable payload. Request opcodes are odd; replies are the request opcode plus one. Every
//! opcode has a mandatory size check, grounded on `original_source/src/wire.h`'s `wire_check`;
//! a frame that fails it is logged and silently dropped.

use collections::bytes::{Cursor, Slice};
use log::warn;
use utils::endian::{u16be, u32be};

pub const ECHO: u8 = 1;
pub const OPEN: u8 = 3;
pub const LISTEN: u8 = 5;
pub const READ: u8 = 7;
pub const WRITE: u8 = 9;
pub const INTERRUPT: u8 = 11;
pub const CLOSE: u8 = 13;

/// Status code on an OPEN reply (§4.6).
pub const STATUS_OK: u8 = 0;
pub const STATUS_FAILED: u8 = 255;

#[derive(Debug, Clone)]
pub enum Request {
	Echo { host: u8, data: u8 },
	Open { host: u8, socket: u32, byte_size: u8 },
	Listen { socket: u32, byte_size: u8 },
	Read { conn: u8, max_octets: u8 },
	Write { conn: u8, payload: Vec<u8> },
	Interrupt { conn: u8 },
	Close { conn: u8 },
}

#[derive(Debug, Clone)]
pub enum Reply {
	Echo { host: u8, data: u8, status: u8 },
	Open { host: u8, socket: u32, conn: u8, byte_size: u8, status: u8 },
	Listen { host: u8, socket: u32, conn: u8, byte_size: u8 },
	Read { conn: u8, payload: Vec<u8> },
	Write { conn: u8, octets_written: u16 },
	Interrupt { conn: u8 },
	Close { conn: u8 },
}

/// Decode one application request from `buf`, checking its mandatory per-opcode size first.
/// Returns `None` (having logged) on an unknown opcode or a frame of the wrong size.
pub fn decode(buf: &Slice) -> Option<Request> {
	let total = buf.len();

	if total == 0 {
		warn!("Dropping empty application request");
		return None;
	}

	let opcode = buf.split_bytes(1)[0];

	let req = match opcode {
		ECHO if total == 3 => {
			let host = buf.split_bytes(1)[0];
			let data = buf.split_bytes(1)[0];
			Request::Echo { host, data }
		}
		OPEN if total == 7 => {
			let host = buf.split_bytes(1)[0];
			let socket: &u32be = buf.split();
			let byte_size = buf.split_bytes(1)[0];
			Request::Open { host, socket: socket.get(), byte_size }
		}
		LISTEN if total == 6 => {
			let socket: &u32be = buf.split();
			let byte_size = buf.split_bytes(1)[0];
			Request::Listen { socket: socket.get(), byte_size }
		}
		READ if total == 3 => {
			let conn = buf.split_bytes(1)[0];
			let max_octets = buf.split_bytes(1)[0];
			Request::Read { conn, max_octets }
		}
		WRITE if total >= 2 => {
			let conn = buf.split_bytes(1)[0];
			let payload = buf.split_bytes(buf.len()).to_vec();
			Request::Write { conn, payload }
		}
		INTERRUPT if total == 2 => Request::Interrupt { conn: buf.split_bytes(1)[0] },
		CLOSE if total == 2 => Request::Close { conn: buf.split_bytes(1)[0] },
		_ => {
			warn!("Dropping malformed application request: opcode {opcode}, {total} bytes");
			return None;
		}
	};

	Some(req)
}

/// Append the wire encoding of `reply` to `cursor`.
pub fn encode(reply: Reply, cursor: Cursor) -> Cursor {
	match reply {
		Reply::Echo { host, data, status } => cursor.push(&(ECHO + 1)).push(&host).push(&data).push(&status),
		Reply::Open { host, socket, conn, byte_size, status } => {
			cursor.push(&(OPEN + 1)).push(&host).push(&u32be::from(socket)).push(&conn).push(&byte_size).push(&status)
		}
		Reply::Listen { host, socket, conn, byte_size } => {
			cursor.push(&(LISTEN + 1)).push(&host).push(&u32be::from(socket)).push(&conn).push(&byte_size)
		}
		Reply::Read { conn, payload } => cursor.push(&(READ + 1)).push(&conn).push(payload.as_slice()),
		Reply::Write { conn, octets_written } => cursor.push(&(WRITE + 1)).push(&conn).push(&u16be::from(octets_written)),
		Reply::Interrupt { conn } => cursor.push(&(INTERRUPT + 1)).push(&conn),
		Reply::Close { conn } => cursor.push(&(CLOSE + 1)).push(&conn),
	}
}

#[cfg(test)]
mod tests {
	use collections::bytes::Bytes;

	use super::*;

	fn decode_raw(raw: &[u8]) -> Option<Request> {
		let bytes = Bytes::new(raw.len());
		let mut b = bytes.clone();
		b.copy_from_slice(raw);
		decode(&bytes.slice(..))
	}

	#[test]
	fn echo_request_decodes() {
		let req = decode_raw(&[ECHO, 1, 0x42]).unwrap();
		assert!(matches!(req, Request::Echo { host: 1, data: 0x42 }));
	}

	#[test]
	fn open_request_decodes() {
		let req = decode_raw(&[OPEN, 1, 0, 0, 0, 7, 8]).unwrap();
		assert!(matches!(req, Request::Open { host: 1, socket: 7, byte_size: 8 }));
	}

	#[test]
	fn wrong_size_is_dropped() {
		assert!(decode_raw(&[ECHO, 1]).is_none());
	}

	#[test]
	fn unknown_opcode_is_dropped() {
		assert!(decode_raw(&[2, 1, 2, 3]).is_none());
	}

	#[test]
	fn write_request_carries_payload() {
		let req = decode_raw(&[WRITE, 9, 1, 2, 3]).unwrap();
		assert!(matches!(req, Request::Write { conn: 9, ref payload } if payload == &[1, 2, 3]));
	}

	#[test]
	fn open_reply_encodes_to_nine_bytes() {
		let mut vec = vec![0u8; 32];
		let end = Cursor::vec(&mut vec, |c| {
			encode(Reply::Open { host: 1, socket: 7, conn: 3, byte_size: 8, status: STATUS_OK }, c).pivot()
		});
		assert_eq!(end, 9);
		assert_eq!(vec[0], OPEN + 1);
	}
}

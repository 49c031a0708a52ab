//! The NCP control protocol on link 0: command opcodes, the payload-length table shared by the
//! decoder and the `ERR(SHORT)` check, and command encode/decode (§4.3).

use collections::bytes::{Cursor, Slice};
use utils::endian::{u16be, u32be};

use crate::error::Reason;

pub const NOP: u8 = 0;
pub const RTS: u8 = 1;
pub const STR: u8 = 2;
pub const CLS: u8 = 3;
pub const ALL: u8 = 4;
pub const GVB: u8 = 5;
pub const RET: u8 = 6;
pub const INR: u8 = 7;
pub const INS: u8 = 8;
pub const ECO: u8 = 9;
pub const ERP: u8 = 10;
pub const ERR: u8 = 11;
pub const RST: u8 = 12;
pub const RRP: u8 = 13;

/// Octets consumed after the opcode byte, indexed by opcode. The decoder and the `ERR(SHORT)`
/// check share this single table (§9 Design Notes: "Manual byte packing").
pub const PAYLOAD_LEN: [usize; 14] = [
	0,  // NOP
	9,  // RTS: rsock(4) + lsock(4) + link(1)
	9,  // STR: rsock(4) + lsock(4) + byte_size(1)
	8,  // CLS: rsock(4) + lsock(4)
	7,  // ALL: link(1) + msg_space(2) + bit_space(4)
	3,  // GVB: link(1) + fm(1) + fb(1)
	7,  // RET: link(1) + msg_space(2) + bit_space(4)
	1,  // INR: link(1)
	1,  // INS: link(1)
	1,  // ECO: data(1)
	1,  // ERP: data(1)
	11, // ERR: code(1) + context(10)
	0,  // RST
	0,  // RRP
];

/// One decoded NCP control command (§4.3's opcode table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
	Nop,
	Rts { rsock: u32, lsock: u32, link: u8 },
	Str { rsock: u32, lsock: u32, byte_size: u8 },
	Cls { rsock: u32, lsock: u32 },
	All { link: u8, msg_space: u16, bit_space: u32 },
	Gvb { link: u8, fm: u8, fb: u8 },
	Ret { link: u8, msg_space: u16, bit_space: u32 },
	Inr { link: u8 },
	Ins { link: u8 },
	Eco { data: u8 },
	Erp { data: u8 },
	Err { code: u8, context: [u8; 10] },
	Rst,
	Rrp,
}

/// Decode one command from the front of `buf`, advancing it past the command.
///
/// Returns `Ok(None)` once `buf` is exhausted (the normal end of a control message). Returns
/// `Err(reason)` on an illegal opcode or a command that would run past the payload end; the caller
/// is expected to reply with `ERR(reason)`.
pub fn decode_one(buf: &Slice) -> Result<Option<Command>, Reason> {
	if buf.is_empty() {
		return Ok(None);
	}

	let opcode = buf.split_bytes(1)[0];

	if opcode as usize > RRP as usize {
		return Err(Reason::Opcode);
	}

	if buf.len() < PAYLOAD_LEN[opcode as usize] {
		return Err(Reason::Short);
	}

	Ok(Some(match opcode {
		NOP => Command::Nop,
		RTS => {
			let rsock: &u32be = buf.split();
			let lsock: &u32be = buf.split();
			let link = buf.split_bytes(1)[0];
			Command::Rts { rsock: rsock.get(), lsock: lsock.get(), link }
		}
		STR => {
			let rsock: &u32be = buf.split();
			let lsock: &u32be = buf.split();
			let byte_size = buf.split_bytes(1)[0];
			Command::Str { rsock: rsock.get(), lsock: lsock.get(), byte_size }
		}
		CLS => {
			let rsock: &u32be = buf.split();
			let lsock: &u32be = buf.split();
			Command::Cls { rsock: rsock.get(), lsock: lsock.get() }
		}
		ALL => {
			let link = buf.split_bytes(1)[0];
			let msg_space: &u16be = buf.split();
			let bit_space: &u32be = buf.split();
			Command::All { link, msg_space: msg_space.get(), bit_space: bit_space.get() }
		}
		GVB => {
			let link = buf.split_bytes(1)[0];
			let fm = buf.split_bytes(1)[0];
			let fb = buf.split_bytes(1)[0];
			Command::Gvb { link, fm, fb }
		}
		RET => {
			let link = buf.split_bytes(1)[0];
			let msg_space: &u16be = buf.split();
			let bit_space: &u32be = buf.split();
			Command::Ret { link, msg_space: msg_space.get(), bit_space: bit_space.get() }
		}
		INR => Command::Inr { link: buf.split_bytes(1)[0] },
		INS => Command::Ins { link: buf.split_bytes(1)[0] },
		ECO => Command::Eco { data: buf.split_bytes(1)[0] },
		ERP => Command::Erp { data: buf.split_bytes(1)[0] },
		ERR => {
			let code = buf.split_bytes(1)[0];
			let context: &[u8; 10] = buf.split();
			Command::Err { code, context: *context }
		}
		RST => Command::Rst,
		RRP => Command::Rrp,
		_ => unreachable!("opcode range checked above"),
	}))
}

/// Append the wire encoding of `cmd` to `cursor`, returning the cursor past the command.
pub fn encode(cmd: Command, cursor: Cursor) -> Cursor {
	match cmd {
		Command::Nop => cursor.push(&NOP),
		Command::Rts { rsock, lsock, link } => cursor.push(&RTS).push(&u32be::from(rsock)).push(&u32be::from(lsock)).push(&link),
		Command::Str { rsock, lsock, byte_size } => cursor.push(&STR).push(&u32be::from(rsock)).push(&u32be::from(lsock)).push(&byte_size),
		Command::Cls { rsock, lsock } => cursor.push(&CLS).push(&u32be::from(rsock)).push(&u32be::from(lsock)),
		Command::All { link, msg_space, bit_space } => cursor.push(&ALL).push(&link).push(&u16be::from(msg_space)).push(&u32be::from(bit_space)),
		Command::Gvb { link, fm, fb } => cursor.push(&GVB).push(&link).push(&fm).push(&fb),
		Command::Ret { link, msg_space, bit_space } => cursor.push(&RET).push(&link).push(&u16be::from(msg_space)).push(&u32be::from(bit_space)),
		Command::Inr { link } => cursor.push(&INR).push(&link),
		Command::Ins { link } => cursor.push(&INS).push(&link),
		Command::Eco { data } => cursor.push(&ECO).push(&data),
		Command::Erp { data } => cursor.push(&ERP).push(&data),
		Command::Err { code, context } => cursor.push(&ERR).push(&code).push(&context),
		Command::Rst => cursor.push(&RST),
		Command::Rrp => cursor.push(&RRP),
	}
}

#[cfg(test)]
mod tests {
	use collections::bytes::Bytes;

	use super::*;

	fn roundtrip(cmd: Command) -> Command {
		let mut vec = vec![0u8; 64];
		let end = Cursor::vec(&mut vec, |c| encode(cmd, c).pivot());
		vec.truncate(end);

		let bytes = Bytes::new(vec.len());
		let mut b = bytes.clone();
		b.copy_from_slice(&vec);

		let slice = bytes.slice(..);
		decode_one(&slice).unwrap().unwrap()
	}

	#[test]
	fn rts_roundtrips() {
		let cmd = Command::Rts { rsock: 0o1002, lsock: 0o0117, link: 42 };
		assert_eq!(roundtrip(cmd), cmd);
	}

	#[test]
	fn all_roundtrips() {
		let cmd = Command::All { link: 46, msg_space: 4, bit_space: 4096 };
		assert_eq!(roundtrip(cmd), cmd);
	}

	#[test]
	fn err_roundtrips() {
		let cmd = Command::Err { code: Reason::Socket.code(), context: [1; 10] };
		assert_eq!(roundtrip(cmd), cmd);
	}

	#[test]
	fn short_rts_reports_short() {
		let raw = [RTS, 0, 0];
		let bytes = Bytes::new(raw.len());
		let mut b = bytes.clone();
		b.copy_from_slice(&raw);
		let slice = bytes.slice(..);

		assert_eq!(decode_one(&slice), Err(Reason::Short));
	}

	#[test]
	fn unknown_opcode_reports_opcode_error() {
		let bytes = Bytes::new(1);
		let mut b = bytes.clone();
		b.copy_from_slice(&[99]);
		let slice = bytes.slice(..);

		assert_eq!(decode_one(&slice), Err(Reason::Opcode));
	}

	#[test]
	fn empty_buffer_is_end_of_message() {
		let bytes = Bytes::new(0);
		let slice = bytes.slice(..);
		assert_eq!(decode_one(&slice), Ok(None));
	}
}

//! Bit-exact encode/decode structures for the IMP envelope and leader (§4.1, §4.2).

use utils::bytes::Cast;
use utils::endian::{u16be, u32be};

/// The magic bytes that open every IMP datagram.
pub const MAGIC: [u8; 4] = *b"H316";

/// The 10-byte fixed portion of an IMP datagram: magic, sequence number, word count.
///
/// The word count includes the 1-word flags cell that is the first word of the payload that
/// follows this header — it is not a separate fixed field.
#[derive(Cast)]
#[repr(C)]
pub struct Header {
	pub magic: [u8; 4],
	pub seq: u32be,
	pub count: u16be,
}

/// The flags cell: the first payload word of every IMP datagram.
#[derive(Cast, Clone, Copy)]
#[repr(C)]
pub struct Flags(u16be);

impl Flags {
	pub const LAST: u16 = 1 << 0;
	pub const READY: u16 = 1 << 1;

	pub fn new(bits: u16) -> Self {
		Self(bits.into())
	}

	pub fn bits(self) -> u16 {
		self.0.get()
	}

	pub fn last(self) -> bool {
		self.bits() & Self::LAST != 0
	}

	pub fn ready(self) -> bool {
		self.bits() & Self::READY != 0
	}
}

/// The leader: the fixed 4-byte prefix of a Host/IMP message (§4.2).
#[derive(Cast, Clone, Copy)]
#[repr(C)]
pub struct Leader {
	/// Low nibble is the leader type (0..10); high nibble is a per-message id echoed by some leader types.
	pub type_id: u8,
	pub host: u8,
	pub link: u8,
	pub subtype: u8,
}

impl Leader {
	pub fn new(ty: LeaderType, id: u8, host: u8, link: u8, subtype: u8) -> Self {
		Self { type_id: (id << 4) | ty as u8, host, link, subtype }
	}

	pub fn ty(self) -> Option<LeaderType> {
		LeaderType::from_u8(self.type_id & 0x0F)
	}

	pub fn id(self) -> u8 {
		self.type_id >> 4
	}
}

/// Leader-byte-0 low nibble (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LeaderType {
	Regular = 0,
	LeaderError = 1,
	ImpDown = 2,
	Blocked = 3,
	Nop = 4,
	Rfnm = 5,
	Full = 6,
	Dead = 7,
	DataError = 8,
	Incompl = 9,
	Reset = 10,
}

impl LeaderType {
	pub fn from_u8(n: u8) -> Option<Self> {
		Some(match n {
			0 => Self::Regular,
			1 => Self::LeaderError,
			2 => Self::ImpDown,
			3 => Self::Blocked,
			4 => Self::Nop,
			5 => Self::Rfnm,
			6 => Self::Full,
			7 => Self::Dead,
			8 => Self::DataError,
			9 => Self::Incompl,
			10 => Self::Reset,
			_ => return None,
		})
	}
}

/// The 5-byte header that opens the payload of a REGULAR message (§4.2, §4.5).
#[derive(Cast, Clone, Copy)]
#[repr(C)]
pub struct RegularHeader {
	pub msg_id: u8,
	pub byte_size: u8,
	pub byte_count: u16be,
	pub pad: u8,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flags_roundtrip() {
		let f = Flags::new(Flags::LAST | Flags::READY);
		assert!(f.last());
		assert!(f.ready());

		let f = Flags::new(0);
		assert!(!f.last());
		assert!(!f.ready());
	}

	#[test]
	fn leader_type_and_id_roundtrip() {
		let l = Leader::new(LeaderType::Rfnm, 3, 42, 0, 0);
		assert_eq!(l.ty(), Some(LeaderType::Rfnm));
		assert_eq!(l.id(), 3);
	}

	#[test]
	fn unknown_leader_type_is_none() {
		let l = Leader { type_id: 0x0B, host: 0, link: 0, subtype: 0 };
		assert_eq!(l.ty(), None);
	}
}

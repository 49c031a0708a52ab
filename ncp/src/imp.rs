//! Datagram framing to the IMP simulator: the magic/sequence envelope, the host-ready bit, and
//! sequence resynchronization (§4.1).

use core::net::{IpAddr, SocketAddr};
use std::net::UdpSocket;

use collections::bytes::{Cursor, Slice};
use log::{debug, warn};
use runtime::Io;
use stakker::Fwd;
use utils::error::*;

use crate::wire::{Flags, Header, Leader, LeaderType, RegularHeader, MAGIC};

/// One decoded IMP datagram, past the envelope and flags cell.
pub struct Received {
	/// Whether the peer's READY bit flipped since the last datagram.
	pub ready_changed: bool,
	pub peer_ready: bool,
	/// `None` for a bare ready-toggle ping (a message with no leader).
	pub leader: Option<Leader>,
	/// Whatever followed the leader (empty for leader types that carry no payload).
	pub payload: Slice,
}

/// Sequence numbering and ready-bit bookkeeping, kept separate from the bound socket so it can be
/// exercised without a live reactor.
#[derive(Default)]
struct Sequencer {
	tx_seq: u32,
	rx_seq: u32,
	local_ready: bool,
	peer_ready: bool,
}

impl Sequencer {
	fn flags(&self) -> u16 {
		let mut bits = Flags::LAST;

		if self.local_ready {
			bits |= Flags::READY;
		}

		bits
	}

	fn next_seq(&mut self) -> u32 {
		let seq = self.tx_seq;
		self.tx_seq += 1;
		seq
	}

	/// Decode one datagram, applying the resynchronization rules of §4.1 "Receive".
	fn receive(&mut self, buf: Slice) -> Option<Received> {
		if buf.len() < core::mem::size_of::<Header>() {
			warn!("IMP datagram shorter than its fixed header, dropping");
			return None;
		}

		let header: &Header = buf.split();

		if header.magic != MAGIC {
			warn!("IMP datagram with bad magic, dropping");
			return None;
		}

		let seq = header.seq.get();
		let count = header.count.get() as usize;

		if seq == 0 && self.rx_seq != 0 {
			debug!("IMP peer restarted, resynchronizing sequence to 0");
			self.rx_seq = 0;
		} else if seq < self.rx_seq {
			warn!("IMP datagram with stale sequence {seq} (expected {}), dropping", self.rx_seq);
			return None;
		} else if seq > self.rx_seq {
			warn!("IMP datagram out of sequence (expected {}, got {seq}), resynchronizing", self.rx_seq);
			self.rx_seq = seq;
		}

		self.rx_seq += 1;

		if count == 0 {
			return Some(Received { ready_changed: false, peer_ready: self.peer_ready, leader: None, payload: buf });
		}

		if buf.len() < core::mem::size_of::<Flags>() {
			warn!("IMP datagram shorter than its declared word count, dropping");
			return None;
		}

		let flags: &Flags = buf.split();
		let ready = flags.ready();
		let ready_changed = ready != self.peer_ready;
		self.peer_ready = ready;

		let declared = count.saturating_sub(1) * 2;
		if buf.len() > declared {
			buf.truncate(declared);
		}

		if count == 1 {
			return Some(Received { ready_changed, peer_ready: ready, leader: None, payload: buf });
		}

		if buf.len() < core::mem::size_of::<Leader>() {
			warn!("IMP leader truncated, dropping");
			return None;
		}

		let leader: &Leader = buf.split();

		debug!(
			"IMP recv: type={:?} host={:03o} link={:03o} subtype={} words={count}",
			leader.ty(),
			leader.host,
			leader.link,
			leader.subtype
		);

		Some(Received { ready_changed, peer_ready: ready, leader: Some(*leader), payload: buf })
	}
}

pub struct Transport {
	io: Io<UdpSocket>,
	seq: Sequencer,
}

impl Transport {
	pub fn bind(imp_host: IpAddr, imp_port: u16, local_port: u16, fwd: Fwd<Slice>) -> Result<Self> {
		let bind_addr = SocketAddr::new(
			match imp_host {
				IpAddr::V4(_) => IpAddr::V4(core::net::Ipv4Addr::UNSPECIFIED),
				IpAddr::V6(_) => IpAddr::V6(core::net::Ipv6Addr::UNSPECIFIED),
			},
			local_port,
		);

		let socket = UdpSocket::bind(bind_addr).map_err(|err| log::error!("Failed to bind IMP socket on port {local_port}: {err}"))?;

		socket.set_nonblocking(true).map_err(|err| log::error!("Failed to set IMP socket non-blocking: {err}"))?;
		socket
			.connect(SocketAddr::new(imp_host, imp_port))
			.map_err(|err| log::error!("Failed to connect IMP socket to {imp_host}:{imp_port}: {err}"))?;

		let io = Io::new(socket, fwd);

		Ok(Self { io, seq: Sequencer::default() })
	}

	/// Send a bare ready-toggle ping: the envelope plus a single flags word, nothing else.
	fn send_ping(&mut self) -> Result {
		let seq = self.seq.next_seq();
		let flags = self.seq.flags();

		self.io.write(|c| {
			c.push(&Header { magic: MAGIC, seq: seq.into(), count: 1u16.into() }).push(&Flags::new(flags));
		})
	}

	/// Toggle the local host-ready bit and announce it to the peer (§4.1 "Host-ready bit").
	pub fn set_ready(&mut self, ready: bool) -> Result {
		if self.seq.local_ready == ready {
			return Ok(());
		}

		self.seq.local_ready = ready;
		self.send_ping()
	}

	/// Send a leader-only message: NOP, RESET, or a locally-detected LEADER_ERROR.
	pub fn send_leader(&mut self, ty: LeaderType, host: u8, link: u8, subtype: u8) -> Result {
		let seq = self.seq.next_seq();
		let flags = self.seq.flags();
		let leader = Leader::new(ty, 0, host, link, subtype);

		self.io.write(|c| {
			c.push(&Header { magic: MAGIC, seq: seq.into(), count: 3u16.into() }).push(&Flags::new(flags)).push(&leader);
		})
	}

	/// Send a REGULAR message: a leader, the 5-byte regular header, and `data` (§4.2, §4.5).
	/// `data` carries either packed NCP control commands (link 0) or raw application bytes.
	pub fn send_regular(&mut self, host: u8, link: u8, byte_size: u8, data: &[u8]) -> Result {
		let seq = self.seq.next_seq();
		let flags = self.seq.flags();
		let leader = Leader::new(LeaderType::Regular, 0, host, link, 0);
		let header = RegularHeader { msg_id: 0, byte_size, byte_count: (data.len() as u16).into(), pad: 0 };

		let body_len = core::mem::size_of::<Leader>() + core::mem::size_of::<RegularHeader>() + data.len();
		let words = 1 + body_len.div_ceil(2);

		self.io.write(|mut c| {
			c = c.push(&Header { magic: MAGIC, seq: seq.into(), count: (words as u16).into() });
			c = c.push(&Flags::new(flags));
			c = c.push(&leader);
			c = c.push(&header);
			c = c.push(data);
			c.pad_to(2);
		})
	}

	/// Decode one datagram, applying the resynchronization rules of §4.1 "Receive".
	pub fn receive(&mut self, buf: Slice) -> Option<Received> {
		self.seq.receive(buf)
	}
}

#[cfg(test)]
mod tests {
	use collections::bytes::Bytes;

	use super::*;

	fn datagram(seq: u32, words: &[u16]) -> Slice {
		let mut vec = vec![0u8; 10 + words.len() * 2];
		Cursor::vec(&mut vec, |c| {
			let mut c = c.push(&Header { magic: MAGIC, seq: seq.into(), count: (words.len() as u16).into() });

			for w in words {
				c = c.push(&utils::endian::u16be::from(*w));
			}
		});

		let bytes = Bytes::new(vec.len());
		let mut b = bytes.clone();
		b.copy_from_slice(&vec);
		bytes.slice(..)
	}

	#[test]
	fn bad_magic_is_dropped() {
		let mut seq = Sequencer::default();
		let mut vec = vec![0u8; 12];
		vec[0] = b'X';
		let bytes = Bytes::new(vec.len());
		let mut b = bytes.clone();
		b.copy_from_slice(&vec);

		assert!(seq.receive(bytes.slice(..)).is_none());
	}

	#[test]
	fn ready_ping_has_no_leader() {
		let mut seq = Sequencer::default();
		let buf = datagram(0, &[Flags::READY]);
		let r = seq.receive(buf).unwrap();

		assert!(r.ready_changed);
		assert!(r.peer_ready);
		assert!(r.leader.is_none());
	}

	#[test]
	fn stale_sequence_is_dropped() {
		let mut seq = Sequencer::default();
		seq.receive(datagram(5, &[0])).unwrap();
		assert!(seq.receive(datagram(3, &[0])).is_none());
	}

	#[test]
	fn peer_restart_resyncs_to_zero() {
		let mut seq = Sequencer::default();
		seq.receive(datagram(5, &[0])).unwrap();
		let r = seq.receive(datagram(0, &[0])).unwrap();
		assert_eq!(seq.rx_seq, 1);
		assert!(!r.ready_changed);
	}

	#[test]
	fn leader_is_decoded_after_flags_word() {
		let mut seq = Sequencer::default();
		let leader = Leader::new(LeaderType::Rfnm, 0, 42, 5, 0);
		let mut vec = vec![0u8; 10 + 2 + 4];

		Cursor::vec(&mut vec, |c| {
			c.push(&Header { magic: MAGIC, seq: 0u32.into(), count: 3u16.into() })
				.push(&Flags::new(Flags::LAST))
				.push(&leader);
		});

		let bytes = Bytes::new(vec.len());
		let mut b = bytes.clone();
		b.copy_from_slice(&vec);

		let r = seq.receive(bytes.slice(..)).unwrap();
		let got = r.leader.unwrap();
		assert_eq!(got.ty(), Some(LeaderType::Rfnm));
		assert_eq!(got.host, 42);
		assert_eq!(got.link, 5);
	}
}

//! Fixed-capacity connection, listener, and host tables (§3), grounded directly on the original
//! `connection[CONNECTIONS]`/`listening[CONNECTIONS]` arrays and their `find_link`/`find_sockets`/
//! `find_listen`/`destroy` linear-scan helpers. The key spaces here are small and bounded, so a
//! linear scan is the idiomatic match for the source rather than a hash map.

use runtime::ClientAddr;
use stakker::FixedTimerKey;

use crate::timers::ConnTimers;

/// Link numbers reserved for data connections (§4.3.1, §9 Design Notes).
pub const LINK_MIN: u8 = 2;
pub const LINK_MAX: u8 = 71;

/// The default connection-table capacity, overridable for testing via `NCP_CONNECTIONS` (§6.2).
pub const DEFAULT_CONNECTIONS: usize = 32;

/// How many REGULAR messages may be outstanding (sent, awaiting RFNM) per remote host (§3, §8).
pub const MAX_OUTSTANDING_RFNM: u8 = 4;

/// The lifecycle state of one half of a connection (§4.3.2).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum HalfState {
	#[default]
	Idle,
	SentReq,
	Open,
	SentCls,
	Closed,
}

#[derive(Clone, Copy, Default)]
pub struct HalfConn {
	pub link: u8,
	pub size: u8,
	pub lsock: u32,
	pub rsock: u32,
	pub state: HalfState,
}

/// The application-visible flag bits tracked on a connection record (§3).
#[derive(Clone, Copy, Default)]
pub struct ConnFlags {
	pub client: bool,
	pub server: bool,
	pub sent_rts: bool,
	pub sent_str: bool,
	pub got_rts: bool,
	pub got_str: bool,
	pub got_socket: bool,
	pub read_pending: bool,
}

/// The operation a connection's timers are currently waiting to time out on (§9 Design Notes:
/// continuations in place of stored callbacks).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Pending {
	#[default]
	None,
	Open,
	Listen,
	Read,
	Write,
	Close,
	/// Client side of ICP: the control pair is open at byte-size 32 and we are waiting for the
	/// server's one-word REGULAR carrying its freshly allocated data socket (§4.5 step 3).
	ClientIcp,
	/// Server side of ICP: either sending the data-socket word, or waiting for the client's RTS
	/// to that socket to complete the real data pair.
	ServerIcp,
}

pub struct Connection {
	/// `None` marks a free slot (the source's `host == -1`).
	pub host: Option<u8>,
	/// The client address that issued the open/listen call that created this record.
	pub client: Option<ClientAddr>,
	pub reader: Option<ClientAddr>,
	pub writer: Option<ClientAddr>,
	pub closer: Option<ClientAddr>,
	pub flags: ConnFlags,
	/// The listening socket this connection belongs to, if it arose from ICP acceptance.
	pub listen: Option<u32>,
	/// The remote socket the application asked to OPEN, reported back in the OPEN reply even
	/// after ICP repoints `rcv.rsock` at the server's internal data socket.
	pub app_socket: u32,
	pub byte_size: u8,
	/// The data byte-size an OPEN/listener-accept is heading towards while the connection is
	/// still in its ICP control phase at byte-size 32.
	pub target_byte_size: u8,
	/// The data socket exchanged during ICP: the one we announced (server role) or the one we
	/// learned from the server's payload (client role). Doubles as the lookup key a late RTS to
	/// that socket is matched against in `ConnTable::find_icp_server`.
	pub icp_data_sock: Option<u32>,
	pub all_msgs: u32,
	pub all_bits: u32,
	pub rcv: HalfConn,
	pub snd: HalfConn,
	pub out_buf: Vec<u8>,
	pub out_pos: usize,
	/// Chunks sent from `out_buf` whose RFNM has not yet come back.
	pub pending_rfnm: u32,
	pub pending: Pending,
	pub timers: ConnTimers,
}

impl Default for Connection {
	fn default() -> Self {
		Self {
			host: None,
			client: None,
			reader: None,
			writer: None,
			closer: None,
			flags: ConnFlags::default(),
			listen: None,
			app_socket: 0,
			byte_size: 8,
			target_byte_size: 8,
			icp_data_sock: None,
			all_msgs: 0,
			all_bits: 0,
			rcv: HalfConn::default(),
			snd: HalfConn::default(),
			out_buf: Vec::new(),
			out_pos: 0,
			pending_rfnm: 0,
			pending: Pending::None,
			timers: ConnTimers::default(),
		}
	}
}

impl Connection {
	pub fn is_free(&self) -> bool {
		self.host.is_none()
	}

	/// Bytes remaining to be sent from `out_buf`.
	pub fn out_remaining(&self) -> usize {
		self.out_buf.len() - self.out_pos
	}

	pub fn both_closed(&self) -> bool {
		self.rcv.state == HalfState::Closed && self.snd.state == HalfState::Closed
	}
}

#[derive(Default)]
pub struct ConnTable {
	slots: Vec<Connection>,
}

impl ConnTable {
	pub fn new(capacity: usize) -> Self {
		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, Connection::default);
		Self { slots }
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn get(&self, idx: usize) -> &Connection {
		&self.slots[idx]
	}

	pub fn get_mut(&mut self, idx: usize) -> &mut Connection {
		&mut self.slots[idx]
	}

	/// Allocate a free slot, grounded on `make_open`'s `find_link(-1, -1)` lookup.
	pub fn alloc(&mut self) -> Option<usize> {
		self.slots.iter().position(Connection::is_free)
	}

	/// Find the connection whose receive or send half is on `link` for `host` (`find_link`).
	pub fn find_link(&self, host: u8, link: u8) -> Option<usize> {
		self.slots
			.iter()
			.position(|c| c.host == Some(host) && (c.rcv.link == link || c.snd.link == link))
	}

	/// Find the connection whose receive or send half matches the (lsock, rsock) pair for `host`
	/// (`find_sockets`).
	pub fn find_sockets(&self, host: u8, lsock: u32, rsock: u32) -> Option<usize> {
		self.slots.iter().position(|c| {
			c.host == Some(host) && ((c.rcv.lsock == lsock && c.rcv.rsock == rsock) || (c.snd.lsock == lsock && c.snd.rsock == rsock))
		})
	}

	/// Find the connection awaiting a data pair on the server-announced ICP socket `data_sock`
	/// (the RTS a client sends once it has decoded the socket word off the control pair).
	pub fn find_icp_server(&self, host: u8, data_sock: u32) -> Option<usize> {
		self.slots.iter().position(|c| c.host == Some(host) && c.icp_data_sock == Some(data_sock))
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
		self.slots.iter_mut()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Connection> {
		self.slots.iter()
	}

	/// Free a record's slot (`destroy`).
	pub fn destroy(&mut self, idx: usize) {
		self.slots[idx] = Connection::default();
	}
}

pub struct Listener {
	pub client: ClientAddr,
	pub byte_size: u8,
}

#[derive(Default)]
pub struct ListenTable {
	slots: Vec<Option<(u32, Listener)>>,
}

impl ListenTable {
	pub fn new(capacity: usize) -> Self {
		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, || None);
		Self { slots }
	}

	pub fn insert(&mut self, sock: u32, listener: Listener) -> Option<usize> {
		if self.find(sock).is_some() {
			return None;
		}

		let idx = self.slots.iter().position(Option::is_none)?;
		self.slots[idx] = Some((sock, listener));
		Some(idx)
	}

	/// `find_listen`: at most one listener per socket value (§3 invariant).
	pub fn find(&self, sock: u32) -> Option<usize> {
		self.slots.iter().position(|s| matches!(s, Some((s_sock, _)) if *s_sock == sock))
	}

	pub fn get(&self, idx: usize) -> &Listener {
		&self.slots[idx].as_ref().expect("listener slot occupied").1
	}
}

#[derive(Default)]
pub struct HostState {
	pub alive: bool,
	pub outstanding_rfnm: u8,
	pub pending_echo: Option<PendingEcho>,
	pub erp_deadline: FixedTimerKey,
	/// FIFO of connection indices, one entry per REGULAR sent to this host still awaiting its
	/// RFNM. A host-level RFNM always credits the oldest outstanding send (§4.4, §5).
	pub rfnm_queue: std::collections::VecDeque<usize>,
}

pub struct PendingEcho {
	pub client: ClientAddr,
	pub host: u8,
	pub data: u8,
}

pub struct HostTable {
	hosts: Box<[HostState; 256]>,
}

impl HostTable {
	pub fn new() -> Self {
		Self { hosts: Box::new(std::array::from_fn(|_| HostState::default())) }
	}

	pub fn get(&self, host: u8) -> &HostState {
		&self.hosts[host as usize]
	}

	pub fn get_mut(&mut self, host: u8) -> &mut HostState {
		&mut self.hosts[host as usize]
	}
}

impl Default for HostTable {
	fn default() -> Self {
		Self::new()
	}
}

/// A bump/reuse allocator over `[LINK_MIN, LINK_MAX]` (§9 Design Notes: "reserve a pool ... and
/// allocate deterministically per connection").
pub struct LinkPool {
	in_use: [bool; (LINK_MAX - LINK_MIN + 1) as usize],
	next: u8,
}

impl LinkPool {
	pub fn new() -> Self {
		Self { in_use: [false; (LINK_MAX - LINK_MIN + 1) as usize], next: LINK_MIN }
	}

	pub fn alloc(&mut self) -> Option<u8> {
		for _ in 0..self.in_use.len() {
			let link = self.next;
			self.next = if self.next == LINK_MAX { LINK_MIN } else { self.next + 1 };

			let slot = (link - LINK_MIN) as usize;
			if !self.in_use[slot] {
				self.in_use[slot] = true;
				return Some(link);
			}
		}

		None
	}

	pub fn free(&mut self, link: u8) {
		if (LINK_MIN..=LINK_MAX).contains(&link) {
			self.in_use[(link - LINK_MIN) as usize] = false;
		}
	}
}

impl Default for LinkPool {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn conn_table_alloc_and_destroy() {
		let mut t = ConnTable::new(4);
		let i = t.alloc().unwrap();
		t.get_mut(i).host = Some(3);
		assert!(t.alloc().unwrap() != i || t.len() > 1);

		t.destroy(i);
		assert!(t.get(i).is_free());
	}

	#[test]
	fn find_link_matches_either_half() {
		let mut t = ConnTable::new(4);
		let i = t.alloc().unwrap();
		t.get_mut(i).host = Some(1);
		t.get_mut(i).snd.link = 46;

		assert_eq!(t.find_link(1, 46), Some(i));
		assert_eq!(t.find_link(1, 47), None);
		assert_eq!(t.find_link(2, 46), None);
	}

	#[test]
	fn link_pool_does_not_double_allocate() {
		let mut pool = LinkPool::new();
		let a = pool.alloc().unwrap();
		let b = pool.alloc().unwrap();
		assert_ne!(a, b);

		pool.free(a);
		let c = pool.alloc().unwrap();
		assert!((LINK_MIN..=LINK_MAX).contains(&c));
	}

	#[test]
	fn link_pool_exhausts() {
		let mut pool = LinkPool::new();
		let mut got = Vec::new();
		for _ in LINK_MIN..=LINK_MAX {
			got.push(pool.alloc().unwrap());
		}
		assert!(pool.alloc().is_none());
	}

	#[test]
	fn listener_table_enforces_unique_socket() {
		let mut t = ListenTable::new(4);
		let client = ClientAddr::from(std::path::Path::new("/tmp/a"));
		assert!(t.insert(0o117, Listener { client: client.clone(), byte_size: 8 }).is_some());
		assert!(t.insert(0o117, Listener { client, byte_size: 8 }).is_none());
	}
}

//! The daemon actor: binds the IMP transport and the application IPC socket, dispatches leader
//! messages and control commands, and drives the connection tables (§4, §5).
//!
//! A connection that arises from an OPEN or a listener accept passes through the Initial
//! Connection Protocol before it carries application data: a control pair at byte-size 32, a
//! one-word REGULAR carrying the server's freshly allocated data socket, then a second RTS/STR
//! exchange for the real data pair at the negotiated byte size (§4.5). One `Connection` record is
//! reused across both phases rather than linking two separate records together; see `DESIGN.md`.

use core::net::IpAddr;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use collections::bytes::Slice;
use log::{debug, error, info, warn};
use runtime::{ClientAddr, DgramIo};
use stakker::{fwd_to, Actor, FixedTimerKey, CX};
use utils::error::*;

use crate::ctl::{self, Command};
use crate::error::Reason;
use crate::imp::Transport;
use crate::ipc::{self, Reply, Request};
use crate::table::{ConnTable, HalfConn, HalfState, HostTable, LinkPool, ListenTable, Listener, Pending};
use crate::timers::Kind as TimerKind;
use crate::wire::LeaderType;

/// Host-level ERP reply deadline (§4.4; not one of the five connection timer slots).
const ERP_TIMEOUT: Duration = Duration::from_secs(20);

pub struct Daemon {
	transport: Transport,
	app: DgramIo<UnixDatagram>,
	conns: ConnTable,
	listeners: ListenTable,
	hosts: HostTable,
	links: LinkPool,
	next_socket: u32,
}

impl Daemon {
	pub fn init(
		cx: CX![],
		imp_host: IpAddr,
		imp_port: u16,
		local_port: u16,
		ipc_path: PathBuf,
		connections: usize,
	) -> Option<Self> {
		let imp_fwd = fwd_to!([cx], on_imp() as (Slice));
		let mut transport = Transport::bind(imp_host, imp_port, local_port, imp_fwd).ok_or(|()| error!("Failed to bind IMP transport"))?;

		// Assert our host-ready bit immediately so the peer's first datagram already sees it (§4.1).
		let _ = transport.set_ready(true);

		let _ = std::fs::remove_file(&ipc_path);

		let socket = UnixDatagram::bind(&ipc_path).ok_or(|err| error!("Failed to bind application socket {}: {err}", ipc_path.display()))?;
		socket.set_nonblocking(true).ok_or(|err| error!("Failed to set application socket non-blocking: {err}"))?;

		let app_fwd = fwd_to!([cx], on_app() as (Slice, ClientAddr));
		let app = DgramIo::new(socket, app_fwd);

		info!("ncp daemon listening on {} ({connections} connections)", ipc_path.display());

		Some(Self {
			transport,
			app,
			conns: ConnTable::new(connections),
			listeners: ListenTable::new(connections),
			hosts: HostTable::new(),
			links: LinkPool::new(),
			next_socket: 0x2000,
		})
	}

	fn alloc_socket(&mut self) -> u32 {
		let s = self.next_socket;
		self.next_socket = self.next_socket.wrapping_add(2);
		s
	}

	// ---- IMP side ----------------------------------------------------------------------

	fn on_imp(&mut self, cx: CX![], buf: Slice) {
		let Some(received) = self.transport.receive(buf) else { return };

		if received.ready_changed {
			self.on_peer_ready_changed(received.peer_ready);
		}

		let Some(leader) = received.leader else {
			// A bare ready-toggle ping: nothing further to dispatch.
			return;
		};

		let Some(ty) = leader.ty() else {
			warn!("IMP message with illegal leader type from {:03o}", leader.host);
			let _ = self.transport.send_leader(LeaderType::LeaderError, leader.host, leader.link, 2);
			return;
		};

		match ty {
			LeaderType::Regular => self.on_regular(cx, leader.host, leader.link, received.payload),
			LeaderType::Rfnm => self.on_rfnm(cx, leader.host),
			LeaderType::Dead => self.on_dead(cx, leader.host, leader.subtype),
			LeaderType::LeaderError => {
				warn!("IMP reports leader error from {:03o}: {}", leader.host, describe_leader_error(leader.subtype));
			}
			LeaderType::ImpDown => warn!("IMP going down"),
			LeaderType::Blocked => warn!("IMP link blocked for {:03o}", leader.host),
			LeaderType::Full => warn!("IMP link table full"),
			LeaderType::DataError => warn!("IMP reports data error from {:03o}", leader.host),
			LeaderType::Incompl => warn!("IMP reports incomplete transmission from {:03o}: {}", leader.host, describe_incompl(leader.subtype)),
			LeaderType::Nop => debug!("IMP NOP"),
			LeaderType::Reset => info!("IMP reset"),
		}
	}

	fn on_rfnm(&mut self, cx: CX![], host: u8) {
		let state = self.hosts.get_mut(host);

		if state.outstanding_rfnm > 0 {
			state.outstanding_rfnm -= 1;
		}

		debug!("RFNM from {host:03o}, outstanding now {}", self.hosts.get(host).outstanding_rfnm);

		// Credit the oldest outstanding send to this host; its connection's WRITE (or ICP
		// socket-word send) may now be complete (§4.5 step 3, §5: "reply_write is called from
		// the RFNM waiter").
		if let Some(idx) = self.hosts.get_mut(host).rfnm_queue.pop_front() {
			if idx < self.conns.len() && !self.conns.get(idx).is_free() {
				if self.conns.get(idx).pending_rfnm > 0 {
					self.conns.get_mut(idx).pending_rfnm -= 1;
				}
				self.try_finish_send(cx, idx);
			}
		}

		// Wake every connection to this host that is waiting on write credit or RFNM gating.
		let idxs: Vec<usize> = self
			.conns
			.iter()
			.enumerate()
			.filter(|(_, c)| c.host == Some(host) && (c.pending == Pending::Write || c.pending == Pending::ServerIcp))
			.map(|(i, _)| i)
			.collect();

		for idx in idxs {
			self.pump_write(cx, idx);
		}
	}

	/// React to the peer's host-ready bit flipping (§4.1), independent of DEAD/RST leader traffic.
	fn on_peer_ready_changed(&mut self, ready: bool) {
		if ready {
			info!("IMP peer host is now ready");
		} else {
			warn!("IMP peer host is no longer ready");
		}
	}

	fn on_dead(&mut self, cx: CX![], host: u8, reason: u8) {
		warn!("Destination {host:03o} {}", describe_dead(reason));

		self.hosts.get_mut(host).alive = false;

		if let Some(echo) = self.hosts.get_mut(host).pending_echo.take() {
			cx.timer_del(self.hosts.get(host).erp_deadline);
			self.hosts.get_mut(host).erp_deadline = FixedTimerKey::default();
			let _ = self.app.write(&echo.client, |c| ipc::encode(Reply::Echo { host: echo.host, data: echo.data, status: ipc::STATUS_FAILED }, c));
		}

		let idxs: Vec<usize> = self.conns.iter().enumerate().filter(|(_, c)| c.host == Some(host)).map(|(i, _)| i).collect();

		for idx in idxs {
			self.fail_and_destroy(cx, idx, ipc::STATUS_FAILED);
		}
	}

	fn on_regular(&mut self, cx: CX![], host: u8, link: u8, payload: Slice) {
		if payload.len() < core::mem::size_of::<crate::wire::RegularHeader>() {
			warn!("Short REGULAR from {host:03o} link {link:03o}");
			let _ = self.transport.send_leader(LeaderType::LeaderError, host, link, 1);
			return;
		}

		let header: &crate::wire::RegularHeader = payload.split();
		let byte_size = header.byte_size;
		let byte_count = header.byte_count.get() as usize;
		let data = payload;

		if link == 0 {
			self.on_control(cx, host, data);
			return;
		}

		let Some(idx) = self.conns.find_link(host, link) else {
			warn!("REGULAR on unknown link {link:03o} from {host:03o}, dropping");
			return;
		};

		if byte_size != 0 && byte_size != self.conns.get(idx).byte_size {
			warn!("REGULAR byte-size mismatch on connection {idx} from {host:03o}: got {byte_size}, expected {}", self.conns.get(idx).byte_size);
		}

		// `byte_count` is the octet count before the sender's word-alignment padding (imp.rs
		// pads every REGULAR body to an even length); trim that padding back off before delivery.
		if byte_count <= data.len() {
			data.truncate(byte_count);
		} else {
			warn!("REGULAR byte-count {byte_count} exceeds payload length {} on connection {idx}", data.len());
		}

		self.deliver_read(cx, idx, &data);
	}

	fn on_control(&mut self, cx: CX![], host: u8, data: Slice) {
		loop {
			match ctl::decode_one(&data) {
				Ok(Some(cmd)) => self.handle_command(cx, host, cmd),
				Ok(None) => break,
				Err(reason) => {
					self.send_err(cx, host, reason);
					break;
				}
			}
		}
	}

	fn send_err(&mut self, _cx: CX![], host: u8, reason: Reason) {
		warn!("Replying ERR({reason}) to {host:03o}");
		let cmd = Command::Err { code: reason.code(), context: [0; 10] };
		self.send_control(host, &[cmd]);
	}

	/// Pack and send a sequence of control commands as one REGULAR on link 0.
	fn send_control(&mut self, host: u8, cmds: &[Command]) {
		let mut buf = vec![0u8; 128];
		let end = collections::bytes::Cursor::vec(&mut buf, |mut c| {
			for cmd in cmds {
				c = ctl::encode(*cmd, c);
			}

			c.pivot()
		});

		buf.truncate(end);

		if self.transport.send_regular(host, 0, 0, &buf).is_err() {
			error!("Failed to send control message to {host:03o}");
		}
	}

	fn handle_command(&mut self, cx: CX![], host: u8, cmd: Command) {
		match cmd {
			Command::Nop => {}
			Command::Rts { rsock, lsock, link } => self.handle_rts(cx, host, rsock, lsock, link),
			Command::Str { rsock, lsock, byte_size } => self.handle_str(cx, host, rsock, lsock, byte_size),
			Command::Cls { rsock, lsock } => self.handle_cls(cx, host, rsock, lsock),
			Command::All { link, msg_space, bit_space } => self.handle_all(cx, host, link, msg_space, bit_space),
			Command::Gvb { link, fm, fb } => self.handle_gvb(host, link, fm, fb),
			Command::Ret { link, msg_space, bit_space } => self.handle_ret(host, link, msg_space, bit_space),
			Command::Inr { link } => debug!("INR from {host:03o} link {link:03o}"),
			Command::Ins { link } => debug!("INS from {host:03o} link {link:03o}"),
			Command::Eco { data } => self.handle_eco(host, data),
			Command::Erp { data } => self.handle_erp(cx, host, data),
			Command::Err { code, .. } => warn!("Received ERR code {code:03o} from {host:03o}"),
			Command::Rst => self.handle_rst(cx, host),
			Command::Rrp => self.handle_rrp(cx, host),
		}
	}

	fn handle_rts(&mut self, cx: CX![], host: u8, rsock: u32, lsock: u32, link: u8) {
		if link == 0 || link > crate::table::LINK_MAX {
			self.send_err(cx, host, Reason::Param);
			return;
		}

		if let Some(idx) = self.conns.find_sockets(host, rsock, lsock) {
			let byte_size = self.conns.get(idx).byte_size;
			let conn = self.conns.get_mut(idx);
			conn.snd = HalfConn { link, size: byte_size, lsock: rsock, rsock: lsock, state: HalfState::Open };
			conn.flags.got_rts = true;

			if !conn.flags.sent_str {
				conn.flags.sent_str = true;
				self.send_control(host, &[Command::Str { rsock: lsock, lsock: rsock, byte_size }]);
			}

			self.maybe_reply(cx, idx);
			return;
		}

		if let Some(listen_idx) = self.listeners.find(rsock) {
			let target_byte_size = self.listeners.get(listen_idx).byte_size;
			let client = self.listeners.get(listen_idx).client.clone();

			let Some(new_link) = self.links.alloc() else {
				self.send_err(cx, host, Reason::Undefined);
				return;
			};

			let Some(idx) = self.conns.alloc() else {
				warn!("Connection table full accepting RTS from {host:03o}");
				self.send_err(cx, host, Reason::Undefined);
				self.links.free(new_link);
				return;
			};

			let my_sock = self.alloc_socket();

			// Rendezvous on the ICP control pair at byte-size 32 (§4.5 step 2); the listener's
			// real byte size is stashed for the data pair that follows once the socket word lands.
			let conn = self.conns.get_mut(idx);
			conn.host = Some(host);
			conn.listen = Some(rsock);
			conn.client = Some(client);
			conn.byte_size = 32;
			conn.target_byte_size = target_byte_size;
			conn.flags.server = true;
			conn.flags.got_rts = true;
			conn.flags.sent_rts = true;
			conn.snd = HalfConn { link, size: 32, lsock: rsock, rsock: lsock, state: HalfState::Open };
			conn.rcv = HalfConn { link: new_link, size: 32, lsock: my_sock, rsock: lsock, state: HalfState::SentReq };
			conn.pending = Pending::ServerIcp;
			conn.timers.arm_rfc(cx, idx);

			self.send_control(host, &[Command::Rts { rsock: lsock, lsock: my_sock, link: new_link }, Command::Str { rsock: lsock, lsock: rsock, byte_size: 32 }]);
			return;
		}

		if let Some(idx) = self.conns.find_icp_server(host, rsock) {
			// The client has decoded our data socket and is opening the real data pair (§4.5
			// step 3, server side).
			let byte_size = self.conns.get(idx).target_byte_size;

			let Some(new_link) = self.links.alloc() else {
				self.send_err(cx, host, Reason::Undefined);
				return;
			};

			let my_sock = self.alloc_socket();

			let conn = self.conns.get_mut(idx);
			conn.snd = HalfConn { link, size: byte_size, lsock: rsock, rsock: lsock, state: HalfState::Open };
			conn.rcv = HalfConn { link: new_link, size: byte_size, lsock: my_sock, rsock: lsock, state: HalfState::SentReq };
			conn.byte_size = byte_size;
			conn.flags.got_rts = true;
			conn.icp_data_sock = None;
			conn.pending = Pending::Listen;
			conn.timers.arm_rfc(cx, idx);

			self.send_control(host, &[Command::Rts { rsock: lsock, lsock: my_sock, link: new_link }, Command::Str { rsock: lsock, lsock: rsock, byte_size }]);
			return;
		}

		warn!("RTS from {host:03o} for unknown socket {rsock:o}");
		self.send_err(cx, host, Reason::Socket);
	}

	fn handle_str(&mut self, cx: CX![], host: u8, rsock: u32, lsock: u32, byte_size: u8) {
		if let Some(idx) = self.conns.find_sockets(host, rsock, lsock) {
			let conn = self.conns.get_mut(idx);

			if conn.rcv.state == HalfState::Idle || conn.rcv.state == HalfState::SentReq {
				conn.rcv.size = byte_size;
				conn.rcv.state = HalfState::Open;
				conn.flags.got_str = true;

				if byte_size != 0 {
					conn.byte_size = byte_size;
				}

				conn.timers.cancel(cx, TimerKind::Rfc);
				self.maybe_reply(cx, idx);
				return;
			}

			conn.flags.got_str = true;
			return;
		}

		warn!("STR from {host:03o} for unknown socket {rsock:o}");
		self.send_err(cx, host, Reason::Socket);
	}

	fn handle_cls(&mut self, cx: CX![], host: u8, rsock: u32, lsock: u32) {
		let Some(idx) = self.conns.find_sockets(host, rsock, lsock) else {
			warn!("CLS from {host:03o} for unknown socket {rsock:o}");
			self.send_err(cx, host, Reason::Socket);
			return;
		};

		let conn = self.conns.get_mut(idx);

		let matches_rcv = conn.rcv.lsock == rsock && conn.rcv.rsock == lsock;
		let half = if matches_rcv { &mut conn.rcv } else { &mut conn.snd };

		let already_sent_cls = half.state == HalfState::SentCls;
		half.state = HalfState::Closed;

		if !already_sent_cls {
			self.send_control(host, &[Command::Cls { rsock: lsock, lsock: rsock }]);
		}

		if let Some(reader) = self.conns.get(idx).reader.clone() {
			let _ = self.app.write(&reader, |c| ipc::encode(Reply::Read { conn: idx as u8, payload: Vec::new() }, c));
			self.conns.get_mut(idx).reader = None;
			self.conns.get_mut(idx).flags.read_pending = false;
		}

		if self.conns.get(idx).both_closed() {
			self.finish_close(cx, idx);
		}
	}

	fn handle_all(&mut self, cx: CX![], host: u8, link: u8, msg_space: u16, bit_space: u32) {
		let Some(idx) = self.conns.find_link(host, link) else {
			warn!("ALL on unknown link {link:03o} from {host:03o}");
			return;
		};

		let conn = self.conns.get_mut(idx);
		conn.all_msgs = conn.all_msgs.saturating_add(msg_space as u32);
		conn.all_bits = conn.all_bits.saturating_add(bit_space);

		self.pump_write(cx, idx);
	}

	/// A GVB asks us to give back unused credit; we reply with how much we actually relinquish.
	fn handle_gvb(&mut self, host: u8, link: u8, fm: u8, fb: u8) {
		let Some(idx) = self.conns.find_link(host, link) else { return };

		let conn = self.conns.get_mut(idx);
		let given_msgs = conn.all_msgs.min(fm as u32);
		let given_bits = conn.all_bits.min(fb as u32);
		conn.all_msgs -= given_msgs;
		conn.all_bits -= given_bits;

		self.send_control(host, &[Command::Ret { link, msg_space: given_msgs as u16, bit_space: given_bits }]);
	}

	fn handle_ret(&mut self, host: u8, link: u8, msg_space: u16, bit_space: u32) {
		if let Some(idx) = self.conns.find_link(host, link) {
			let conn = self.conns.get_mut(idx);
			conn.all_msgs = conn.all_msgs.saturating_add(msg_space as u32);
			conn.all_bits = conn.all_bits.saturating_add(bit_space);
		}
	}

	fn handle_eco(&mut self, host: u8, data: u8) {
		debug!("Received ECO {data:03o} from {host:03o}, replying ERP");
		self.send_control(host, &[Command::Erp { data }]);
	}

	fn handle_erp(&mut self, cx: CX![], host: u8, data: u8) {
		debug!("Received ERP {data:03o} from {host:03o}");

		let Some(echo) = self.hosts.get_mut(host).pending_echo.take() else { return };
		cx.timer_del(self.hosts.get(host).erp_deadline);
		self.hosts.get_mut(host).erp_deadline = FixedTimerKey::default();

		let status = if echo.data == data { ipc::STATUS_OK } else { ipc::STATUS_FAILED };
		let _ = self.app.write(&echo.client, |c| ipc::encode(Reply::Echo { host: echo.host, data, status }, c));
	}

	fn handle_rst(&mut self, cx: CX![], host: u8) {
		info!("Received RST from {host:03o}");
		self.hosts.get_mut(host).alive = true;

		if let Some(echo) = self.hosts.get_mut(host).pending_echo.take() {
			cx.timer_del(self.hosts.get(host).erp_deadline);
			self.hosts.get_mut(host).erp_deadline = FixedTimerKey::default();
			let _ = self.app.write(&echo.client, |c| ipc::encode(Reply::Echo { host: echo.host, data: echo.data, status: ipc::STATUS_FAILED }, c));
		}

		let idxs: Vec<usize> = self.conns.iter().enumerate().filter(|(_, c)| c.host == Some(host)).map(|(i, _)| i).collect();

		for idx in idxs {
			self.fail_and_destroy(cx, idx, ipc::STATUS_FAILED);
		}

		self.send_control(host, &[Command::Rrp]);
	}

	fn handle_rrp(&mut self, cx: CX![], host: u8) {
		info!("Received RRP from {host:03o}");
		self.hosts.get_mut(host).alive = true;

		if self.hosts.get(host).erp_deadline != FixedTimerKey::default() {
			cx.timer_del(self.hosts.get(host).erp_deadline);
			self.hosts.get_mut(host).erp_deadline = FixedTimerKey::default();
		}

		let idxs: Vec<usize> = self
			.conns
			.iter()
			.enumerate()
			.filter(|(_, c)| c.host == Some(host) && c.pending == Pending::ClientIcp)
			.map(|(i, _)| i)
			.collect();

		for idx in idxs {
			self.retry_open(cx, idx);
		}
	}

	/// Re-issue the RTS for an OPEN that was waiting on host liveness.
	fn retry_open(&mut self, cx: CX![], idx: usize) {
		let conn = self.conns.get(idx);
		let Some(host) = conn.host else { return };
		let rsock = conn.rcv.rsock;
		let lsock = conn.rcv.lsock;
		let link = conn.rcv.link;

		let conn = self.conns.get_mut(idx);
		conn.timers.cancel(cx, TimerKind::Rrp);
		conn.timers.arm_rfc(cx, idx);
		self.send_control(host, &[Command::Rts { rsock, lsock, link }]);
	}

	// ---- data path ----------------------------------------------------------------------

	fn deliver_read(&mut self, cx: CX![], idx: usize, data: &[u8]) {
		if self.conns.get(idx).pending == Pending::ClientIcp {
			self.deliver_icp_socket(cx, idx, data);
			return;
		}

		let conn = self.conns.get_mut(idx);

		if let Some(reader) = conn.reader.take() {
			conn.flags.read_pending = false;
			conn.timers.cancel(cx, TimerKind::All);
			let _ = self.app.write(&reader, |c| ipc::encode(Reply::Read { conn: idx as u8, payload: data.to_vec() }, c));
		} else {
			debug!("Dropping data on connection {idx}: no pending reader");
		}
	}

	/// §4.5 step 3: the one-word payload on the ICP control pair is the server's freshly
	/// allocated data socket. Mark `GOT_SOCKET`, close the ICP receive half, and kick off the
	/// real data-pair RTS at the byte size the application originally asked for.
	fn deliver_icp_socket(&mut self, cx: CX![], idx: usize, data: &[u8]) {
		if data.len() < 4 {
			warn!("Short ICP data-socket payload on connection {idx}, giving up on OPEN");
			self.fail_and_destroy(cx, idx, ipc::STATUS_FAILED);
			return;
		}

		let server_sock = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);

		let conn = self.conns.get_mut(idx);
		conn.timers.cancel(cx, TimerKind::All);
		conn.flags.got_socket = true;
		conn.icp_data_sock = Some(server_sock);

		let old_link = conn.rcv.link;
		let Some(new_link) = self.links.alloc() else {
			warn!("Link pool exhausted completing ICP on connection {idx}");
			self.fail_and_destroy(cx, idx, ipc::STATUS_FAILED);
			return;
		};
		self.links.free(old_link);

		let my_sock = self.alloc_socket();
		let conn = self.conns.get_mut(idx);
		let target_size = conn.target_byte_size;
		let host = conn.host.unwrap_or(0);

		conn.rcv = HalfConn { link: new_link, size: target_size, lsock: my_sock, rsock: server_sock, state: HalfState::SentReq };
		conn.byte_size = target_size;
		conn.flags.sent_str = false;
		conn.pending = Pending::Open;
		conn.timers.arm_rfc(cx, idx);

		self.send_control(host, &[Command::Rts { rsock: server_sock, lsock: my_sock, link: new_link }]);
	}

	/// Send as much of the output buffer as current ALL credit and RFNM gating allow.
	fn pump_write(&mut self, cx: CX![], idx: usize) {
		loop {
			let conn = self.conns.get(idx);
			let Some(host) = conn.host else { return };

			if conn.out_remaining() == 0 {
				break;
			}

			if self.hosts.get(host).outstanding_rfnm >= crate::table::MAX_OUTSTANDING_RFNM {
				return;
			}

			let byte_size = conn.byte_size.max(1) as u32;
			let max_by_bits = conn.all_bits / byte_size;
			let chunk = (conn.all_msgs.min(max_by_bits) as usize).min(conn.out_remaining());

			if chunk == 0 {
				return;
			}

			let link = conn.snd.link;
			let start = conn.out_pos;
			let data = conn.out_buf[start..start + chunk].to_vec();

			if self.transport.send_regular(host, link, conn.byte_size, &data).is_err() {
				error!("Failed to send REGULAR on connection {idx}");
				return;
			}

			let conn = self.conns.get_mut(idx);
			conn.out_pos += chunk;
			conn.all_msgs -= 1;
			conn.all_bits -= chunk as u32 * byte_size;
			conn.pending_rfnm += 1;

			self.hosts.get_mut(host).outstanding_rfnm += 1;
			self.hosts.get_mut(host).rfnm_queue.push_back(idx);
		}

		self.try_finish_send(cx, idx);
	}

	/// A WRITE (or the ICP socket-word send) is complete only once the buffer is empty *and*
	/// every chunk sent from it has its own RFNM back (§4.5 step 3, §5).
	fn try_finish_send(&mut self, cx: CX![], idx: usize) {
		let conn = self.conns.get(idx);

		if conn.out_remaining() != 0 || conn.pending_rfnm != 0 {
			return;
		}

		match conn.pending {
			Pending::Write => {
				let octets = conn.out_pos as u16;
				self.finish_write(cx, idx, octets);
			}
			Pending::ServerIcp => self.finish_server_icp_send(cx, idx),
			_ => {}
		}
	}

	fn finish_write(&mut self, cx: CX![], idx: usize, octets: u16) {
		let conn = self.conns.get_mut(idx);
		conn.pending = Pending::None;
		conn.out_buf.clear();
		conn.out_pos = 0;
		conn.timers.cancel(cx, TimerKind::All);

		if let Some(writer) = conn.writer.take() {
			let _ = self.app.write(&writer, |c| ipc::encode(Reply::Write { conn: idx as u8, octets_written: octets }, c));
		}
	}

	fn maybe_reply(&mut self, cx: CX![], idx: usize) {
		let conn = self.conns.get(idx);

		if conn.rcv.state != HalfState::Open || conn.snd.state != HalfState::Open {
			return;
		}

		self.conns.get_mut(idx).timers.cancel(cx, TimerKind::Rfc);

		let host = conn.host.unwrap_or(0);
		let byte_size = conn.byte_size;
		let rsock = conn.rcv.rsock;
		let app_socket = conn.app_socket;
		let pending = conn.pending;

		match pending {
			Pending::Open => {
				if let Some(client) = conn.client.clone() {
					let _ = self.app.write(&client, |c| {
						ipc::encode(Reply::Open { host, socket: app_socket, conn: idx as u8, byte_size, status: ipc::STATUS_OK }, c)
					});
				}
				self.conns.get_mut(idx).pending = Pending::None;
			}
			Pending::Listen => {
				if let Some(client) = conn.client.clone() {
					let listen_sock = conn.listen.unwrap_or(rsock);
					let _ =
						self.app.write(&client, |c| ipc::encode(Reply::Listen { host, socket: listen_sock, conn: idx as u8, byte_size }, c));
				}
				self.conns.get_mut(idx).pending = Pending::None;
			}
			Pending::ClientIcp => self.begin_client_icp_receive(cx, idx),
			Pending::ServerIcp => self.begin_server_icp_send(cx, idx),
			_ => {
				self.conns.get_mut(idx).pending = Pending::None;
			}
		}
	}

	/// Client side of ICP: the control pair is open at byte-size 32. Grant the server ALL credit
	/// for one word so it can send us its data socket (§4.5 step 2).
	fn begin_client_icp_receive(&mut self, cx: CX![], idx: usize) {
		let conn = self.conns.get_mut(idx);
		conn.timers.arm_all(cx, idx);
		let host = conn.host.unwrap_or(0);
		let link = conn.snd.link;
		self.send_control(host, &[Command::All { link, msg_space: 1, bit_space: 32 }]);
	}

	/// Server side of ICP: the control pair is open at byte-size 32. Allocate the data socket we
	/// will hand off and queue it as a one-word REGULAR, to go out as soon as ALL credit allows.
	fn begin_server_icp_send(&mut self, cx: CX![], idx: usize) {
		let my_data_sock = self.alloc_socket();

		let conn = self.conns.get_mut(idx);
		conn.icp_data_sock = Some(my_data_sock);
		conn.out_buf = my_data_sock.to_be_bytes().to_vec();
		conn.out_pos = 0;
		conn.timers.arm_all(cx, idx);

		self.pump_write(cx, idx);
	}

	/// The data-socket word has been fully sent and RFNM'd. Free the ICP control link and wait
	/// for the client's RTS to the announced data socket to complete the real data pair.
	fn finish_server_icp_send(&mut self, cx: CX![], idx: usize) {
		let conn = self.conns.get_mut(idx);
		conn.timers.cancel(cx, TimerKind::All);
		conn.out_buf.clear();
		conn.out_pos = 0;

		let old_link = conn.rcv.link;
		self.links.free(old_link);

		let conn = self.conns.get_mut(idx);
		conn.rcv = HalfConn::default();
		conn.pending = Pending::ServerIcp;
	}

	fn fail_and_destroy(&mut self, cx: CX![], idx: usize, status: u8) {
		let conn = self.conns.get(idx);

		match conn.pending {
			Pending::Open | Pending::ClientIcp => {
				if let Some(client) = conn.client.clone() {
					let host = conn.host.unwrap_or(0);
					let socket = conn.app_socket;
					let byte_size = conn.byte_size;
					let _ = self.app.write(&client, |c| ipc::encode(Reply::Open { host, socket, conn: idx as u8, byte_size, status }, c));
				}
			}
			Pending::Read => {
				if let Some(reader) = conn.reader.clone() {
					let _ = self.app.write(&reader, |c| ipc::encode(Reply::Read { conn: idx as u8, payload: Vec::new() }, c));
				}
			}
			Pending::Write => {
				if let Some(writer) = conn.writer.clone() {
					let octets = conn.out_pos as u16;
					let _ = self.app.write(&writer, |c| ipc::encode(Reply::Write { conn: idx as u8, octets_written: octets }, c));
				}
			}
			Pending::Close | Pending::Listen | Pending::ServerIcp | Pending::None => {}
		}

		self.destroy(cx, idx);
	}

	fn finish_close(&mut self, cx: CX![], idx: usize) {
		let conn = self.conns.get(idx);

		if let Some(closer) = conn.closer.clone() {
			let _ = self.app.write(&closer, |c| ipc::encode(Reply::Close { conn: idx as u8 }, c));
		}

		self.destroy(cx, idx);
	}

	fn destroy(&mut self, cx: CX![], idx: usize) {
		let conn = self.conns.get(idx);

		for link in [conn.rcv.link, conn.snd.link] {
			if link != 0 {
				self.links.free(link);
			}
		}

		for kind in [TimerKind::Rrp, TimerKind::Rfnm, TimerKind::All, TimerKind::Rfc, TimerKind::Cls] {
			self.conns.get_mut(idx).timers.cancel(cx, kind);
		}

		self.conns.destroy(idx);
	}

	// ---- timers -------------------------------------------------------------------------

	fn on_conn_timeout(&mut self, cx: CX![], idx: usize, kind: TimerKind) {
		self.conns.get_mut(idx).timers.clear(kind);

		if self.conns.get(idx).is_free() {
			return;
		}

		match kind {
			TimerKind::Rfc => {
				warn!("RFC timeout on connection {idx}");
				self.fail_and_destroy(cx, idx, ipc::STATUS_FAILED);
			}
			TimerKind::All => {
				let conn = self.conns.get(idx);
				match conn.pending {
					Pending::Write => {
						warn!("ALL timeout on connection {idx}, reporting partial transfer");
						let octets = conn.out_pos as u16;
						self.finish_write(cx, idx, octets);
					}
					Pending::Read => {
						warn!("ALL timeout on connection {idx}, reporting partial transfer");
						self.fail_and_destroy(cx, idx, ipc::STATUS_FAILED);
					}
					Pending::ClientIcp | Pending::ServerIcp => {
						warn!("ICP timed out waiting for ALL credit on connection {idx}, giving up");
						self.fail_and_destroy(cx, idx, ipc::STATUS_FAILED);
					}
					_ => {}
				}
			}
			TimerKind::Cls => {
				debug!("CLS timeout on connection {idx}, destroying locally");
				self.finish_close(cx, idx);
			}
			TimerKind::Rrp => {
				warn!("RRP timeout on connection {idx}, giving up on OPEN");
				self.fail_and_destroy(cx, idx, ipc::STATUS_FAILED);
			}
			TimerKind::Rfnm => {
				warn!("RFNM timeout on connection {idx}");
			}
		}
	}

	fn on_erp_timeout(&mut self, host: u8) {
		self.hosts.get_mut(host).erp_deadline = FixedTimerKey::default();

		if let Some(echo) = self.hosts.get_mut(host).pending_echo.take() {
			warn!("ERP timed out for host {host:03o}");
			let _ = self.app.write(&echo.client, |c| ipc::encode(Reply::Echo { host: echo.host, data: echo.data, status: ipc::STATUS_FAILED }, c));
		}
	}

	// ---- application side ----------------------------------------------------------------

	fn on_app(&mut self, cx: CX![], buf: Slice, addr: ClientAddr) {
		let Some(req) = ipc::decode(&buf) else { return };

		debug!("Received application request {req:?} from {:?}", addr.path());

		match req {
			Request::Echo { host, data } => self.app_echo(cx, addr, host, data),
			Request::Open { host, socket, byte_size } => self.app_open(cx, addr, host, socket, byte_size),
			Request::Listen { socket, byte_size } => self.app_listen(addr, socket, byte_size),
			Request::Read { conn, max_octets } => self.app_read(cx, addr, conn, max_octets),
			Request::Write { conn, payload } => self.app_write(cx, addr, conn, payload),
			Request::Interrupt { conn } => self.app_interrupt(addr, conn),
			Request::Close { conn } => self.app_close(cx, addr, conn),
		}
	}

	fn app_echo(&mut self, cx: CX![], addr: ClientAddr, host: u8, data: u8) {
		if self.hosts.get(host).pending_echo.is_some() {
			let _ = self.app.write(&addr, |c| ipc::encode(Reply::Echo { host, data, status: ipc::STATUS_FAILED }, c));
			return;
		}

		self.hosts.get_mut(host).pending_echo = Some(crate::table::PendingEcho { client: addr, host, data });

		let actor: Actor<Daemon> = cx.access_actor().clone();
		let key = cx.after(ERP_TIMEOUT, move |s| actor.apply(s, move |this, _cx| this.on_erp_timeout(host)));
		self.hosts.get_mut(host).erp_deadline = key;

		self.send_control(host, &[Command::Eco { data }]);
	}

	fn app_open(&mut self, cx: CX![], addr: ClientAddr, host: u8, socket: u32, byte_size: u8) {
		let Some(link) = self.links.alloc() else {
			let _ = self.app.write(&addr, |c| ipc::encode(Reply::Open { host, socket, conn: 0, byte_size, status: ipc::STATUS_FAILED }, c));
			return;
		};

		let Some(idx) = self.conns.alloc() else {
			warn!("Connection table full on OPEN to {host:03o}");
			self.links.free(link);
			let _ = self.app.write(&addr, |c| ipc::encode(Reply::Open { host, socket, conn: 0, byte_size, status: ipc::STATUS_FAILED }, c));
			return;
		};

		let my_sock = self.alloc_socket();

		// Rendezvous on the ICP control pair at byte-size 32 first (§4.5 step 1); the requested
		// byte size is stashed for the data pair that follows once the socket word arrives.
		let conn = self.conns.get_mut(idx);
		conn.host = Some(host);
		conn.client = Some(addr);
		conn.app_socket = socket;
		conn.byte_size = 32;
		conn.target_byte_size = byte_size;
		conn.flags.client = true;
		conn.flags.sent_rts = true;
		conn.rcv = HalfConn { link, size: 32, lsock: my_sock, rsock: socket, state: HalfState::SentReq };
		conn.pending = Pending::ClientIcp;

		if self.hosts.get(host).alive {
			conn.timers.arm_rfc(cx, idx);
			self.send_control(host, &[Command::Rts { rsock: socket, lsock: my_sock, link }]);
		} else {
			// Host has never spoken: RST first, and wait out the RRP deadline before retrying.
			conn.timers.arm_rrp(cx, idx);
			self.send_control(host, &[Command::Rst]);
		}
	}

	fn app_listen(&mut self, addr: ClientAddr, socket: u32, byte_size: u8) {
		if self.listeners.find(socket).is_some() {
			warn!("Duplicate listen on socket {socket:o}");
			return;
		}

		if self.listeners.insert(socket, Listener { client: addr, byte_size }).is_none() {
			warn!("Listener table full for socket {socket:o}");
		}
	}

	fn app_read(&mut self, cx: CX![], addr: ClientAddr, conn_idx: u8, max_octets: u8) {
		let idx = conn_idx as usize;

		if idx >= self.conns.len() || self.conns.get(idx).is_free() {
			let _ = self.app.write(&addr, |c| ipc::encode(Reply::Read { conn: conn_idx, payload: Vec::new() }, c));
			return;
		}

		let conn = self.conns.get_mut(idx);
		conn.reader = Some(addr);
		conn.flags.read_pending = true;
		conn.pending = Pending::Read;
		conn.timers.arm_all(cx, idx);

		let host = conn.host.unwrap_or(0);
		let link = conn.snd.link;
		self.send_control(host, &[Command::All { link, msg_space: 1, bit_space: (max_octets as u32) * conn.byte_size.max(1) as u32 }]);
	}

	fn app_write(&mut self, cx: CX![], addr: ClientAddr, conn_idx: u8, mut payload: Vec<u8>) {
		let idx = conn_idx as usize;

		if idx >= self.conns.len() || self.conns.get(idx).is_free() {
			let _ = self.app.write(&addr, |c| ipc::encode(Reply::Write { conn: conn_idx, octets_written: 0 }, c));
			return;
		}

		const OUT_BUF_CAP: usize = 4096;
		if payload.len() > OUT_BUF_CAP {
			warn!("Truncating WRITE on connection {idx} from {} to {OUT_BUF_CAP} octets", payload.len());
			payload.truncate(OUT_BUF_CAP);
		}

		let conn = self.conns.get_mut(idx);
		conn.writer = Some(addr);
		conn.out_buf = payload;
		conn.out_pos = 0;
		conn.pending = Pending::Write;
		conn.timers.arm_all(cx, idx);

		self.pump_write(cx, idx);
	}

	fn app_interrupt(&mut self, addr: ClientAddr, conn_idx: u8) {
		let idx = conn_idx as usize;

		if idx < self.conns.len() && !self.conns.get(idx).is_free() {
			let conn = self.conns.get(idx);
			let host = conn.host.unwrap_or(0);
			let link = conn.snd.link;
			self.send_control(host, &[Command::Inr { link }]);
		}

		let _ = self.app.write(&addr, |c| ipc::encode(Reply::Interrupt { conn: conn_idx }, c));
	}

	fn app_close(&mut self, cx: CX![], addr: ClientAddr, conn_idx: u8) {
		let idx = conn_idx as usize;

		if idx >= self.conns.len() || self.conns.get(idx).is_free() {
			let _ = self.app.write(&addr, |c| ipc::encode(Reply::Close { conn: conn_idx }, c));
			return;
		}

		let conn = self.conns.get_mut(idx);
		conn.closer = Some(addr);
		conn.pending = Pending::Close;

		let host = conn.host.unwrap_or(0);

		for half in [&mut conn.rcv, &mut conn.snd] {
			if half.state != HalfState::Closed && half.state != HalfState::SentCls {
				half.state = HalfState::SentCls;
			}
		}

		let rcv = conn.rcv;
		let snd = conn.snd;

		conn.timers.arm_cls(cx, idx);

		if rcv.state == HalfState::SentCls {
			self.send_control(host, &[Command::Cls { rsock: rcv.rsock, lsock: rcv.lsock }]);
		}

		if snd.state == HalfState::SentCls {
			self.send_control(host, &[Command::Cls { rsock: snd.rsock, lsock: snd.lsock }]);
		}

		if self.conns.get(idx).both_closed() {
			self.finish_close(cx, idx);
		}
	}
}

fn describe_dead(reason: u8) -> &'static str {
	match reason {
		0 => "cannot be reached",
		1 => "is not up",
		3 => "communication administratively prohibited",
		_ => "dead, unknown reason",
	}
}

fn describe_incompl(reason: u8) -> &'static str {
	match reason {
		0 => "host did not accept message quickly enough",
		1 => "message too long",
		2 => "message took too long in transmission",
		3 => "message lost in network",
		4 => "resources unavailable",
		5 => "I/O failure during reception",
		_ => "unknown reason",
	}
}

fn describe_leader_error(reason: u8) -> &'static str {
	match reason {
		0 => "IMP error during leader",
		1 => "message less than 32 bits",
		2 => "illegal type",
		_ => "unknown reason",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn describe_dead_matches_known_reasons() {
		assert_eq!(describe_dead(1), "is not up");
		assert_eq!(describe_dead(99), "dead, unknown reason");
	}

	#[test]
	fn describe_incompl_matches_known_reasons() {
		assert_eq!(describe_incompl(3), "message lost in network");
	}

	#[test]
	fn describe_leader_error_matches_known_reasons() {
		assert_eq!(describe_leader_error(2), "illegal type");
	}
}

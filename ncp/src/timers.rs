//! The five per-connection timer slots (§3, §4.4): a small struct of `FixedTimerKey`s armed with
//! `cx.after` and cleared before their callback runs so the callback may re-arm them.

use std::time::Duration;

use stakker::{Actor, FixedTimerKey, CX};

use crate::Daemon;

pub const RRP_TIMEOUT: Duration = Duration::from_secs(20);
pub const RFNM_TIMEOUT: Duration = Duration::from_secs(10);
pub const ALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const RFC_TIMEOUT: Duration = Duration::from_secs(3);
pub const CLS_TIMEOUT: Duration = Duration::from_secs(3);

/// Which of a connection's five timer slots elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
	Rrp,
	Rfnm,
	All,
	Rfc,
	Cls,
}

#[derive(Default)]
pub struct ConnTimers {
	rrp: FixedTimerKey,
	rfnm: FixedTimerKey,
	all: FixedTimerKey,
	rfc: FixedTimerKey,
	cls: FixedTimerKey,
}

impl ConnTimers {
	fn slot_mut(&mut self, kind: Kind) -> &mut FixedTimerKey {
		match kind {
			Kind::Rrp => &mut self.rrp,
			Kind::Rfnm => &mut self.rfnm,
			Kind::All => &mut self.all,
			Kind::Rfc => &mut self.rfc,
			Kind::Cls => &mut self.cls,
		}
	}

	fn arm(&mut self, cx: CX![Daemon], idx: usize, kind: Kind, duration: Duration) {
		let actor: Actor<Daemon> = cx.access_actor().clone();

		let key = cx.after(duration, move |s| actor.apply(s, move |this, cx| this.on_conn_timeout(cx, idx, kind)));

		*self.slot_mut(kind) = key;
	}

	pub fn arm_rrp(&mut self, cx: CX![Daemon], idx: usize) {
		self.arm(cx, idx, Kind::Rrp, RRP_TIMEOUT);
	}

	pub fn arm_rfnm(&mut self, cx: CX![Daemon], idx: usize) {
		self.arm(cx, idx, Kind::Rfnm, RFNM_TIMEOUT);
	}

	pub fn arm_all(&mut self, cx: CX![Daemon], idx: usize) {
		self.arm(cx, idx, Kind::All, ALL_TIMEOUT);
	}

	pub fn arm_rfc(&mut self, cx: CX![Daemon], idx: usize) {
		self.arm(cx, idx, Kind::Rfc, RFC_TIMEOUT);
	}

	pub fn arm_cls(&mut self, cx: CX![Daemon], idx: usize) {
		self.arm(cx, idx, Kind::Cls, CLS_TIMEOUT);
	}

	/// Cancel a still-pending timer, e.g. because its precondition was satisfied some other way.
	pub fn cancel(&mut self, cx: CX![Daemon], kind: Kind) {
		cx.timer_del(*self.slot_mut(kind));
		*self.slot_mut(kind) = FixedTimerKey::default();
	}

	/// Clear a slot that has just fired, so the timeout handler is free to re-arm it.
	pub fn clear(&mut self, kind: Kind) {
		*self.slot_mut(kind) = FixedTimerKey::default();
	}
}

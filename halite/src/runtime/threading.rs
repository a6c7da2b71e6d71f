//! Cooperative suspension: a thread-state word with a suspend-request flag
//! that takes effect at the next safepoint.

use std::sync::atomic::{AtomicU32, Ordering};

const STATE_MASK: u32 = 0x7;
const SUSPEND_REQUEST: u32 = 0x8;

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ThreadState {
	Idle = 0,
	Runnable = 1,
	Running = 2,
	Waiting = 3,
	Preempted = 4,
}

impl ThreadState {
	fn from_bits(bits: u32) -> ThreadState {
		match bits & STATE_MASK {
			0 => ThreadState::Idle,
			1 => ThreadState::Runnable,
			2 => ThreadState::Running,
			3 => ThreadState::Waiting,
			_ => ThreadState::Preempted,
		}
	}
}

/// Per-thread state word. Safepoints sit at every allocation and back
/// edge; a suspend request OR-ed into a running thread's word makes the
/// next safepoint park the thread in `Preempted`.
pub struct ThreadControl(AtomicU32);

impl ThreadControl {
	pub fn new() -> Self {
		Self(AtomicU32::new(ThreadState::Idle as u32))
	}

	pub fn state(&self) -> ThreadState {
		ThreadState::from_bits(self.0.load(Ordering::Acquire))
	}

	pub fn suspend_requested(&self) -> bool {
		self.0.load(Ordering::Acquire) & SUSPEND_REQUEST != 0
	}

	pub fn set_state(&self, state: ThreadState) {
		// Keeps a pending suspend request intact across state moves.
		let mut current = self.0.load(Ordering::Acquire);
		loop {
			let next = (current & SUSPEND_REQUEST) | state as u32;
			match self.0.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
				Ok(_) => return,
				Err(observed) => current = observed,
			}
		}
	}

	/// Flags the thread for suspension; returns whether it was running and
	/// will park itself at its next safepoint.
	pub fn request_suspend(&self) -> bool {
		let previous = self.0.fetch_or(SUSPEND_REQUEST, Ordering::AcqRel);
		ThreadState::from_bits(previous) == ThreadState::Running
	}

	/// The safepoint poll. Returns true when the thread parked itself.
	pub fn safepoint(&self) -> bool {
		let expected = ThreadState::Running as u32 | SUSPEND_REQUEST;
		self.0
			.compare_exchange(expected, ThreadState::Preempted as u32, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Only the suspend requester may move a preempted thread to `Waiting`,
	/// taking ownership of the eventual resume.
	pub fn take_preempted(&self) -> bool {
		self.0
			.compare_exchange(
				ThreadState::Preempted as u32,
				ThreadState::Waiting as u32,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.is_ok()
	}

	pub fn resume(&self) {
		self.set_state(ThreadState::Runnable);
	}
}

impl Default for ThreadControl {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn suspension_takes_effect_at_the_next_safepoint() {
		let control = ThreadControl::new();
		control.set_state(ThreadState::Running);

		// No request pending: the safepoint is free.
		assert!(!control.safepoint());

		assert!(control.request_suspend());
		assert!(control.suspend_requested());
		assert!(control.safepoint());
		assert_eq!(control.state(), ThreadState::Preempted);

		// Only one caller wins the preempted thread.
		assert!(control.take_preempted());
		assert!(!control.take_preempted());
		assert_eq!(control.state(), ThreadState::Waiting);

		control.resume();
		assert_eq!(control.state(), ThreadState::Runnable);
	}

	#[test]
	fn state_moves_preserve_a_pending_request() {
		let control = ThreadControl::new();
		control.set_state(ThreadState::Running);
		control.request_suspend();
		control.set_state(ThreadState::Running);
		assert!(control.suspend_requested());
	}
}

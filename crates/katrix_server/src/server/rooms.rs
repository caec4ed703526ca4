#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use katrix_domain::RoomId;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Default)]
struct RoomEntry {
	aliases: Vec<String>,
	/// Aliases have been fetched (possibly as an empty list).
	resolved: bool,
	lookup_in_flight: bool,
}

#[derive(Debug, Serialize)]
struct RoomView<'a> {
	id: &'a str,
	aliases: &'a [String],
}

/// Joined rooms and their aliases, filled in as sync discovers rooms.
#[derive(Debug, Default)]
pub struct RoomDirectory {
	rooms: Mutex<BTreeMap<RoomId, RoomEntry>>,
}

impl RoomDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a room; returns `true` if it was not known yet.
	pub fn record(&self, room: &RoomId) -> bool {
		let mut rooms = self.rooms.lock();
		if rooms.contains_key(room) {
			return false;
		}
		rooms.insert(room.clone(), RoomEntry::default());
		true
	}

	/// Rooms whose aliases are unknown and not being fetched; marks them in flight.
	pub fn claim_unresolved(&self) -> Vec<RoomId> {
		let mut rooms = self.rooms.lock();
		rooms
			.iter_mut()
			.filter(|(_, e)| !e.resolved && !e.lookup_in_flight)
			.map(|(id, e)| {
				e.lookup_in_flight = true;
				id.clone()
			})
			.collect()
	}

	pub fn set_aliases(&self, room: &RoomId, aliases: Vec<String>) {
		let mut rooms = self.rooms.lock();
		let entry = rooms.entry(room.clone()).or_default();
		entry.aliases = aliases;
		entry.resolved = true;
		entry.lookup_in_flight = false;
	}

	/// A lookup failed; the room is retried on a later pass.
	pub fn release(&self, room: &RoomId) {
		if let Some(entry) = self.rooms.lock().get_mut(room) {
			entry.lookup_in_flight = false;
		}
	}

	pub fn len(&self) -> usize {
		self.rooms.lock().len()
	}

	/// JSON snapshot: `[{"id": ..., "aliases": [...]}, ...]`.
	pub fn snapshot_json(&self) -> String {
		let rooms = self.rooms.lock();
		let view: Vec<RoomView<'_>> = rooms
			.iter()
			.map(|(id, e)| RoomView {
				id: id.as_str(),
				aliases: &e.aliases,
			})
			.collect();
		serde_json::to_string(&view).unwrap_or_else(|_| "[]".to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn room(id: &str) -> RoomId {
		RoomId::new(id).expect("room id")
	}

	#[test]
	fn unresolved_rooms_are_claimed_once() {
		let dir = RoomDirectory::new();
		assert!(dir.record(&room("!a:x")));
		assert!(!dir.record(&room("!a:x")));
		dir.record(&room("!b:x"));

		assert_eq!(dir.claim_unresolved().len(), 2);
		assert!(dir.claim_unresolved().is_empty());

		dir.set_aliases(&room("!a:x"), vec!["#lobby:x".to_string()]);
		dir.release(&room("!b:x"));
		assert_eq!(dir.claim_unresolved(), vec![room("!b:x")]);
	}

	#[test]
	fn snapshot_lists_rooms_with_aliases() {
		let dir = RoomDirectory::new();
		dir.record(&room("!a:x"));
		dir.set_aliases(&room("!a:x"), vec!["#lobby:x".to_string()]);

		let v: serde_json::Value = serde_json::from_str(&dir.snapshot_json()).expect("json");
		assert_eq!(v[0]["id"], "!a:x");
		assert_eq!(v[0]["aliases"][0], "#lobby:x");
	}
}

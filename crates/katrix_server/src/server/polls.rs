#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Prefix of a vote message in a room: `!vote <poll> <option>`.
pub const VOTE_PREFIX: &str = "!vote";

/// Keyed vote tally: poll -> option -> count.
#[derive(Debug, Default)]
pub struct PollTally {
	polls: Mutex<BTreeMap<String, BTreeMap<String, u64>>>,
}

impl PollTally {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn vote(&self, poll: &str, option: &str) -> u64 {
		let mut polls = self.polls.lock();
		let count = polls
			.entry(poll.to_string())
			.or_default()
			.entry(option.to_string())
			.or_default();
		*count += 1;
		*count
	}

	/// Apply `body` if it is a vote message. Returns the poll and option counted.
	pub fn apply_message(&self, body: &str) -> Option<(String, String)> {
		let (poll, option) = parse_vote(body)?;
		self.vote(&poll, &option);
		Some((poll, option))
	}

	pub fn count(&self, poll: &str, option: &str) -> u64 {
		self.polls
			.lock()
			.get(poll)
			.and_then(|p| p.get(option))
			.copied()
			.unwrap_or(0)
	}

	/// JSON snapshot: `{"poll": {"option": count}}`.
	pub fn snapshot_json(&self) -> String {
		serde_json::to_string(&*self.polls.lock()).unwrap_or_else(|_| "{}".to_string())
	}
}

fn parse_vote(body: &str) -> Option<(String, String)> {
	let mut words = body.split_whitespace();
	if words.next()? != VOTE_PREFIX {
		return None;
	}
	let poll = words.next()?;
	let option = words.collect::<Vec<_>>().join(" ");
	if option.is_empty() {
		return None;
	}
	Some((poll.to_ascii_lowercase(), option.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counts_votes_per_option() {
		let tally = PollTally::new();
		assert!(tally.apply_message("!vote lunch pizza").is_some());
		assert!(tally.apply_message("!vote lunch Pizza").is_some());
		assert!(tally.apply_message("!vote lunch sushi rolls").is_some());

		assert_eq!(tally.count("lunch", "pizza"), 2);
		assert_eq!(tally.count("lunch", "sushi rolls"), 1);
		assert_eq!(tally.count("dinner", "pizza"), 0);
	}

	#[test]
	fn ignores_non_votes() {
		let tally = PollTally::new();
		assert!(tally.apply_message("hello").is_none());
		assert!(tally.apply_message("!vote").is_none());
		assert!(tally.apply_message("!vote lunch").is_none());
		assert!(tally.apply_message("!voter lunch pizza").is_none());
		assert_eq!(tally.snapshot_json(), "{}");
	}

	#[test]
	fn snapshot_is_nested_json() {
		let tally = PollTally::new();
		tally.vote("lunch", "pizza");
		let v: serde_json::Value = serde_json::from_str(&tally.snapshot_json()).expect("json");
		assert_eq!(v["lunch"]["pizza"], 1);
	}
}

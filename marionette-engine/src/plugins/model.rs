//! Timing and composition: `model.sleep` and `model.spawn`.

use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::plugin::{str_arg, usize_arg, ArgKind, Outcome, Plugin};
use async_trait::async_trait;
use marionette_core::{ArgValue, FormatSpec};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// `model.sleep(distribution)`: pause for a delay drawn from a literal such as
/// `{'0.005': 0.5, '0.02': 0.5}` (seconds mapped to probability).
pub struct Sleep;

/// `model.spawn(format, count)`: run `count` complete child sessions of
/// another format, one after the other, over this session's connection.
pub struct Spawn;

/// Parsed `model.sleep` distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
	entries: Vec<(Duration, f64)>,
}

impl Distribution {
	pub fn parse(src: &str) -> Result<Self> {
		let bad = |reason: String| Error::invalid_args("model.sleep", reason);
		let body = src
			.trim()
			.strip_prefix('{')
			.and_then(|s| s.strip_suffix('}'))
			.ok_or_else(|| bad(format!("{src:?} is not a {{delay: probability}} literal")))?;
		let mut entries = Vec::new();
		for item in body.split(',').map(str::trim).filter(|s| !s.is_empty()) {
			let (key, value) = item.split_once(':').ok_or_else(|| bad(format!("entry {item:?} has no ':'")))?;
			let key = key.trim().trim_matches(|c| c == '\'' || c == '"');
			let secs: f64 = key.parse().map_err(|_| bad(format!("delay {key:?} is not a number")))?;
			let prob: f64 = value.trim().parse().map_err(|_| bad(format!("probability {value:?} is not a number")))?;
			if !(prob.is_finite() && prob >= 0.0) {
				return Err(bad(format!("entry {item:?} out of range")));
			}
			let delay = Duration::try_from_secs_f64(secs).map_err(|_| bad(format!("entry {item:?} out of range")))?;
			entries.push((delay, prob));
		}
		if entries.is_empty() {
			return Err(bad("empty distribution".into()));
		}
		Ok(Self { entries })
	}

	/// Inverse-CDF draw; the last entry absorbs any probability shortfall.
	pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
		let coin: f64 = rng.gen();
		let mut acc = 0.0;
		for (delay, prob) in &self.entries {
			acc += prob;
			if coin < acc {
				return *delay;
			}
		}
		self.entries.last().map(|(d, _)| *d).unwrap_or_default()
	}
}

#[async_trait]
impl Plugin for Sleep {
	fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str] }

	async fn invoke(&self, _fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome> {
		let dist = Distribution::parse(str_arg("model.sleep", args, 0)?)?;
		let delay = dist.sample(&mut rand::thread_rng());
		trace!(?delay, "model.sleep");
		tokio::time::sleep(delay).await;
		Ok(Outcome::Success)
	}
}

#[async_trait]
impl Plugin for Spawn {
	fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str, ArgKind::Int] }

	async fn invoke(&self, fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome> {
		let format = str_arg("model.spawn", args, 0)?;
		let count = usize_arg("model.spawn", args, 1)?;
		let max = fsm.settings().max_spawn_depth;
		if fsm.depth() >= max {
			return Err(Error::protocol(format!("model.spawn of {format:?} exceeds depth {max}")));
		}
		let spec = FormatSpec::parse(format)?;
		let (id, doc) = fsm.context().formats.load(&spec)?;
		fsm.context().plugins.validate(&doc)?;
		let doc = Arc::new(doc);
		for i in 0..count {
			debug!(format = %id, child = i, depth = fsm.depth() + 1, "model.spawn");
			let mut child = fsm.spawn_child(doc.clone());
			Box::pin(child.execute()).await?;
			if fsm.instance_id() == 0 && child.instance_id() != 0 {
				fsm.set_instance_id(child.instance_id());
			}
		}
		Ok(Outcome::Success)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::conn::Conn;
	use crate::context::EngineContext;
	use marionette_core::Party;
	use marionette_stream::StreamSet;
	use rand::SeedableRng;
	use rand_chacha::ChaCha20Rng;

	#[test]
	fn parse_distribution() {
		let d = Distribution::parse("{'0.005': 0.5, '0.02': 0.3, \"1\": 0.2}").unwrap();
		assert_eq!(
			d.entries,
			vec![
				(Duration::from_millis(5), 0.5),
				(Duration::from_millis(20), 0.3),
				(Duration::from_secs(1), 0.2)
			]
		);
		assert!(Distribution::parse("{}").is_err());
		assert!(Distribution::parse("'0.1': 1").is_err());
		assert!(Distribution::parse("{'x': 1}").is_err());
		assert!(Distribution::parse("{'0.1': -1}").is_err());
		assert!(Distribution::parse("{'-0.5': 1}").is_err());
		assert!(Distribution::parse("{'1e30': 1}").is_err());
		assert!(Distribution::parse("{'inf': 1}").is_err());
	}

	#[test]
	fn sample_stays_in_support() {
		let d = Distribution::parse("{'0.1': 0.25, '0.2': 0.25}").unwrap();
		let mut rng = ChaCha20Rng::seed_from_u64(7);
		for _ in 0..200 {
			let s = d.sample(&mut rng);
			assert!(s == Duration::from_millis(100) || s == Duration::from_millis(200));
		}
		let single = Distribution::parse("{'0': 1.0}").unwrap();
		assert_eq!(single.sample(&mut rng), Duration::ZERO);
	}

	#[tokio::test]
	async fn sleep_waits_for_the_drawn_delay() {
		let ctx = EngineContext::default();
		let (_, doc) = ctx.formats.load(&"dummy".parse().unwrap()).unwrap();
		let (io, _peer) = tokio::io::duplex(64);
		let mut fsm = Fsm::new(ctx, Arc::new(doc), Party::Client, Conn::new(io), StreamSet::new());
		let started = std::time::Instant::now();
		let outcome = Sleep.invoke(&mut fsm, &[ArgValue::Str("{'0.02': 1.0}".into())]).await.unwrap();
		assert_eq!(outcome, Outcome::Success);
		assert!(started.elapsed() >= Duration::from_millis(20));
		assert!(Sleep.invoke(&mut fsm, &[ArgValue::Str("{'1e30': 1}".into())]).await.is_err());
	}
}

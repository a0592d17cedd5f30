//! `channel.bind(var)`: open an ephemeral listening port and publish it in a
//! session variable.

use crate::error::Result;
use crate::fsm::Fsm;
use crate::plugin::{str_arg, ArgKind, Outcome, Plugin};
use async_trait::async_trait;
use marionette_core::ArgValue;
use tokio::net::TcpListener;
use tracing::debug;

pub struct Bind;

#[async_trait]
impl Plugin for Bind {
	fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str] }

	async fn invoke(&self, fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome> {
		let var = str_arg("channel.bind", args, 0)?;
		if fsm.var(var).is_some() {
			return Ok(Outcome::Success);
		}
		let host = fsm.settings().channel_bind_host.clone();
		let listener = TcpListener::bind((host.as_str(), 0)).await?;
		let port = listener.local_addr()?.port();
		debug!(var, port, "channel bound");
		fsm.set_var(var, ArgValue::Int(i64::from(port)));
		fsm.bind_channel(var, listener);
		Ok(Outcome::Success)
	}
}

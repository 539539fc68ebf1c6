
use std::time::Duration;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerTickSkipped {
	pub replica_id: u32,
}
impl_slog!(SchedulerTickSkipped, Debug, "previous tick still running, skipping this one");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerTickFinished {
	pub replica_id: u32,
	pub send_sessions: usize,
	pub receive_sessions: usize,
	pub fallbacks: usize,
	#[serde(with = "crate::serde_utils::duration")]
	pub duration: Duration,
}
impl_slog!(SchedulerTickFinished, Debug, "finished a scheduler tick");

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
	#[error("job type <{0}> is not registered")]
	UnknownJob(String),
	#[error("job type <{0}> registered twice")]
	DuplicateJob(String),
	#[error("job type <{0}> has a zero interval")]
	ZeroInterval(String),
	#[error("scheduler is shut down")]
	ShutDown,
}

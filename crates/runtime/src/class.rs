/// Execution classes used to label spawned tasks in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// The primary's event pump. Must never block.
	Bus,
	/// Command handler work started on behalf of a worker.
	Handler,
	/// Pipe readers, writers and child-process waiters.
	Io,
	/// Timer-driven work such as throttled broadcasts.
	Timer,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Bus => "bus",
			Self::Handler => "handler",
			Self::Io => "io",
			Self::Timer => "timer",
		}
	}
}

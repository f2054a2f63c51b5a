pub mod affinity;
pub mod clock;
pub mod collector;
pub mod config;
pub mod context;
pub mod gate;
pub mod log;
pub mod pause;
pub mod pipeline;
pub mod producer;
pub mod record;
pub mod stage;

pub use collector::{LatencyReport, PERCENTILES};
pub use config::RunConfig;
pub use context::RunContext;
pub use gate::{stage_gate_id, Gate, GateRegistry, NOTHING_COMPLETED};
pub use log::{Appender, Entry, RecordLog, Tailer};
pub use pause::{Bounded, BusySpin, Deadline, PauseStrategy, Yielding};
pub use pipeline::{run, RunReport};
pub use producer::{Pretoucher, ProducerStats};
pub use record::{RecordLayout, RecordView, MAX_STAGES};
pub use stage::StageStats;

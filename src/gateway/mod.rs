pub mod correlator;
pub mod keep_alive;
pub mod stats;

pub use correlator::{
    Correlator, CorrelatorState, GatewayDisposition, Origin, PendingTransaction, RtuBus,
    TcpResponder,
};
pub use keep_alive::{KeepAlivePoller, KeepAliveState};
pub use stats::GatewayStats;

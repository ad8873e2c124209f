//! The types most embedders need

pub use crate::client::{ConnectInfo, RedirectTarget};
pub use crate::config::{EngineConfig, HttpProxyConfig, SocksAuth, SocksProxyConfig, VhostConfig};
pub use crate::conn::{ConnId, Connection, LrsState, PendingTimeout, RoleTag, RxFlowReason};
pub use crate::dns::{GaiResolver, Resolve};
pub use crate::protocol::{CallbackAction, ChildReaper, Protocol, Reason, WireCodec};
pub use crate::role::{Role, WriteKind, WriteProtocol};
pub use crate::service::{Worker, WorkerBuilder};
pub use crate::telemetry::{ConnStats, ConnStatsSnapshot};
pub use crate::transport::{Interest, PollEvent, Poller, Socket, SocketFactory, SocketId};
pub use crate::vhost::{TlsFlags, Vhost, WorkerId};

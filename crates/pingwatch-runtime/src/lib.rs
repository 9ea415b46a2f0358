//! pingwatch runtime: probing, log persistence, monitor loops and the
//! multi-instance manager. Detection logic lives in `pingwatch-core`.

pub mod attachment;
pub mod instance;
pub mod manager;
pub mod persist;
pub mod prober;

pub use attachment::{
    AttachmentProvider, NoAttachment, StaticAttachment, WirelessAttachment, resolve_identity,
};
pub use instance::{MonitorInstance, MonitorSnapshot, Persistence, TickReport};
pub use manager::{InstanceOptions, ManagerError, MonitorManager};
pub use persist::{EpisodeStore, PersistError, ProbeLogBuffer, ProbeLogSink, ProbeRecord};
pub use prober::{Prober, SystemPinger};

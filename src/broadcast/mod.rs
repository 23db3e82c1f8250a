pub mod events;
pub mod hub;

pub use events::{
    HubEvent, IntervalClosed, MonitoringUpdate, SessionEnded, UpdateContext, WindowStatus,
};
pub use hub::{BroadcastHub, PublishReport, SubscriberId};

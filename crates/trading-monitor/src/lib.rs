//! Logging and the observability surface.

mod events;
mod logging;

pub use events::{
    ChannelObserver, CompositeObserver, EventObserver, RecordingObserver, TraderEvent,
    TracingObserver,
};
pub use logging::setup_logging;

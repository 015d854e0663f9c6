use market_data::{Engine, SubscriberHub};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub hub: SubscriberHub,
    /// Subscriber keepalive deadline; pings go out at half of it.
    pub ws_keepalive: Duration,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, hub: SubscriberHub, ws_keepalive: Duration) -> Self {
        Self {
            engine,
            hub,
            ws_keepalive,
        }
    }
}

pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod push;

use std::sync::Arc;

use rodnya_db::Database;

use crate::dispatcher::Dispatcher;
use crate::push::PushClient;

/// Shared state of the WebSocket gateway.
pub struct GatewayState {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub push: PushClient,
}

pub type SharedState = Arc<GatewayState>;

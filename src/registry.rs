//! Opt-in process-wide default instances.
//!
//! Embedders that want an ambient client or server register one here
//! explicitly and tear it down themselves; nothing in this crate does so
//! implicitly.

use std::sync::{Arc, Mutex};

use crate::client::Client;
use crate::server::Server;

static DEFAULT_CLIENT: Mutex<Option<Client>> = Mutex::new(None);
static DEFAULT_SERVER: Mutex<Option<Arc<Server>>> = Mutex::new(None);

pub fn set_default_client(client: Client) {
    *DEFAULT_CLIENT.lock().unwrap() = Some(client);
}

pub fn default_client() -> Option<Client> {
    DEFAULT_CLIENT.lock().unwrap().clone()
}

pub fn clear_default_client() {
    *DEFAULT_CLIENT.lock().unwrap() = None;
}

pub fn set_default_server(server: Arc<Server>) {
    *DEFAULT_SERVER.lock().unwrap() = Some(server);
}

pub fn default_server() -> Option<Arc<Server>> {
    DEFAULT_SERVER.lock().unwrap().clone()
}

pub fn clear_default_server() {
    *DEFAULT_SERVER.lock().unwrap() = None;
}

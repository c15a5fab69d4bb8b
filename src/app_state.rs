use crate::hub::Hub;
use crate::persistence::SnapshotStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub store: SnapshotStore,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, store: SnapshotStore) -> Self {
        Self { hub, store }
    }
}

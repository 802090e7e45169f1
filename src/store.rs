use async_trait::async_trait;

use crate::{error::Error, message::RoomInfo};

/// Durable storage for room snapshots. The hub only ever writes to it.
#[async_trait]
pub trait RoomInfoStore: Send + Sync {
    async fn save(&self, rooms: Vec<RoomInfo>) -> Result<(), Error>;
}

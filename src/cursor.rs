use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::DeviceId;
use crate::error::StateError;
use crate::state::{StateFile, SyncStateData};

/// Server-issued timestamps bounding incremental pulls for one device.
///
/// Zero means "pull everything". Timestamps from different servers are not
/// comparable, so each server keeps its own row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Label of the server the timestamps came from
    #[serde(default)]
    pub server: String,
    pub user_id: i64,
    pub device_id: DeviceId,
    /// Subscription pull cursor
    pub last_timestamp: i64,
    /// Episode action pull cursor
    pub episodes_timestamp: i64,
}

impl SyncCursor {
    pub fn zero(user_id: i64, device_id: DeviceId) -> Self {
        Self {
            server: String::new(),
            user_id,
            device_id,
            last_timestamp: 0,
            episodes_timestamp: 0,
        }
    }

    pub fn get(&self, which: CursorKind) -> i64 {
        match which {
            CursorKind::Subscriptions => self.last_timestamp,
            CursorKind::Episodes => self.episodes_timestamp,
        }
    }

    fn slot(&mut self, which: CursorKind) -> &mut i64 {
        match which {
            CursorKind::Subscriptions => &mut self.last_timestamp,
            CursorKind::Episodes => &mut self.episodes_timestamp,
        }
    }
}

/// Which of the two cursors an update targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Subscriptions,
    Episodes,
}

/// Per (server, user, device) cursors; rows are created lazily and only ever
/// move forward
#[derive(Debug, Clone)]
pub struct CursorStore {
    state: Arc<StateFile>,
    server: String,
}

impl CursorStore {
    pub fn new(state: Arc<StateFile>) -> Self {
        Self {
            state,
            server: String::new(),
        }
    }

    /// The same store, reading and writing only `server`'s rows
    pub fn for_server(&self, server: &str) -> Self {
        Self {
            state: self.state.clone(),
            server: server.to_string(),
        }
    }

    /// Current cursors, creating a zero row on first access.
    ///
    /// Virtual (negative) device ids never reach the store: they have no
    /// row to read and get the zero cursor.
    pub fn get_cursors(&self, user_id: i64, device_id: DeviceId) -> Result<SyncCursor, StateError> {
        if device_id.is_virtual() {
            return Ok(self.zero(user_id, device_id));
        }

        if let Some(cursor) = self.state.read(|data| {
            find(data, &self.server, user_id, device_id).map(|i| data.cursors[i].clone())
        }) {
            return Ok(cursor);
        }

        self.state
            .transaction(|data| Ok(upsert(data, &self.server, user_id, device_id).clone()))
    }

    /// Move one cursor forward; a smaller value than the stored one is ignored.
    ///
    /// Returns the value now stored.
    pub fn advance_cursor(
        &self,
        user_id: i64,
        device_id: DeviceId,
        which: CursorKind,
        new_value: i64,
    ) -> Result<i64, StateError> {
        if device_id.is_virtual() {
            return Ok(0);
        }

        self.state.transaction(|data| {
            let slot = upsert(data, &self.server, user_id, device_id).slot(which);
            if new_value > *slot {
                debug!(
                    server = %self.server,
                    user_id,
                    %device_id,
                    ?which,
                    from = *slot,
                    to = new_value,
                    "advancing cursor"
                );
                *slot = new_value;
            }
            Ok(*slot)
        })
    }

    /// Force both cursors back to zero ahead of a full resync
    pub fn reset_cursors(&self, user_id: i64, device_id: DeviceId) -> Result<(), StateError> {
        if device_id.is_virtual() {
            return Ok(());
        }

        self.state.transaction(|data| {
            let cursor = upsert(data, &self.server, user_id, device_id);
            cursor.last_timestamp = 0;
            cursor.episodes_timestamp = 0;
            Ok(())
        })
    }

    fn zero(&self, user_id: i64, device_id: DeviceId) -> SyncCursor {
        SyncCursor {
            server: self.server.clone(),
            ..SyncCursor::zero(user_id, device_id)
        }
    }
}

fn find(data: &SyncStateData, server: &str, user_id: i64, device_id: DeviceId) -> Option<usize> {
    data.cursors
        .iter()
        .position(|c| c.server == server && c.user_id == user_id && c.device_id == device_id)
}

fn upsert<'d>(
    data: &'d mut SyncStateData,
    server: &str,
    user_id: i64,
    device_id: DeviceId,
) -> &'d mut SyncCursor {
    let index = match find(data, server, user_id, device_id) {
        Some(index) => index,
        None => {
            data.cursors.push(SyncCursor {
                server: server.to_string(),
                ..SyncCursor::zero(user_id, device_id)
            });
            data.cursors.len() - 1
        }
    };
    &mut data.cursors[index]
}

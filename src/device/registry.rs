// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StateError;
use crate::state::{StateFile, SyncStateData};

/// Device type given to devices first seen in a remote listing
pub const REMOTE_DEVICE_TYPE: &str = "remote";

/// Local identifier of a sync device.
///
/// Negative values are ids reported by a remote server that aggregates
/// several devices; they have no local row until materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub i64);

impl DeviceId {
    pub fn is_virtual(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named sync endpoint registered for a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub user_id: i64,
    pub name: String,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

/// How a caller names the device a pass should run for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// The user's default device, created from the configured name if absent
    Default,
    /// A known local device
    Id(DeviceId),
    /// A local device by name, created on first use
    Named(String),
    /// A device known only from a remote listing
    Remote { remote_id: DeviceId, name: String },
}

/// Maps logical sync devices to local records.
///
/// Every mutation is one [`StateFile`] transaction, so a default
/// reassignment never exposes zero or two defaults to other passes.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    state: Arc<StateFile>,
    system_user_id: i64,
}

impl DeviceRegistry {
    pub fn new(state: Arc<StateFile>, system_user_id: i64) -> Self {
        Self {
            state,
            system_user_id,
        }
    }

    pub fn list_devices(&self, user_id: i64) -> Vec<Device> {
        self.state.read(|data| {
            let mut devices: Vec<Device> = data
                .devices
                .iter()
                .filter(|d| d.user_id == user_id)
                .cloned()
                .collect();
            devices.sort_by_key(|d| (d.created_at, d.id));
            devices
        })
    }

    pub fn get_device(&self, user_id: i64, device_id: DeviceId) -> Option<Device> {
        self.state.read(|data| {
            data.devices
                .iter()
                .find(|d| d.user_id == user_id && d.id == device_id)
                .cloned()
        })
    }

    /// The device flagged default, else the oldest device, else `None`
    pub fn get_default_device(&self, user_id: i64) -> Option<Device> {
        self.state.read(|data| {
            let flagged = data
                .devices
                .iter()
                .find(|d| d.user_id == user_id && d.is_default);
            flagged
                .or_else(|| oldest(data, user_id))
                .cloned()
        })
    }

    /// Insert or refresh the device named `name`; idempotent on `(user_id, name)`.
    ///
    /// A user's first device becomes the default automatically.
    pub fn create_or_update_device(
        &self,
        user_id: i64,
        name: &str,
        device_type: &str,
        caption: Option<&str>,
        make_default: bool,
    ) -> Result<DeviceId, StateError> {
        self.ensure_not_system(user_id)?;

        self.state.transaction(|data| {
            let now = Utc::now();
            let id = match find_by_name(data, user_id, name) {
                Some(index) => {
                    let device = &mut data.devices[index];
                    device.device_type = device_type.to_string();
                    if let Some(caption) = caption {
                        device.caption = Some(caption.to_string());
                    }
                    device.is_active = true;
                    device.last_sync = Some(now);
                    device.id
                }
                None => {
                    let first = !data.devices.iter().any(|d| d.user_id == user_id);
                    let id = insert_device(data, user_id, name, device_type, caption, now);
                    if first {
                        mark_default(data, user_id, id);
                    }
                    info!(user_id, %id, name, "registered sync device");
                    id
                }
            };

            if make_default {
                mark_default(data, user_id, id);
            }
            Ok(id)
        })
    }

    /// Clear any previous default and flag `device_id`, in one transaction
    pub fn set_default_device(&self, user_id: i64, device_id: DeviceId) -> Result<(), StateError> {
        self.state.transaction(|data| {
            let owned = data
                .devices
                .iter()
                .any(|d| d.user_id == user_id && d.id == device_id);
            if !owned {
                return Err(StateError::UnknownDevice { user_id, device_id });
            }
            mark_default(data, user_id, device_id);
            Ok(())
        })
    }

    /// Give a remote-only device a stable local identity.
    ///
    /// An existing local device with the same name is reused; otherwise a
    /// device of type [`REMOTE_DEVICE_TYPE`] is created and made default.
    pub fn resolve_virtual_device(
        &self,
        user_id: i64,
        remote_name: &str,
    ) -> Result<DeviceId, StateError> {
        self.ensure_not_system(user_id)?;

        self.state.transaction(|data| {
            if let Some(index) = find_by_name(data, user_id, remote_name) {
                return Ok(data.devices[index].id);
            }

            let id = insert_device(
                data,
                user_id,
                remote_name,
                REMOTE_DEVICE_TYPE,
                None,
                Utc::now(),
            );
            mark_default(data, user_id, id);
            info!(user_id, %id, remote_name, "materialized virtual device");
            Ok(id)
        })
    }

    /// Turn a selector into a concrete local device
    pub fn resolve(
        &self,
        user_id: i64,
        selector: &DeviceSelector,
        fallback_name: &str,
        caption: Option<&str>,
    ) -> Result<Device, StateError> {
        let id = match selector {
            DeviceSelector::Default => match self.get_default_device(user_id) {
                Some(device) => return Ok(device),
                None => self.create_or_update_device(user_id, fallback_name, "server", caption, true)?,
            },
            DeviceSelector::Id(device_id) => *device_id,
            DeviceSelector::Named(name) => self.create_or_update_device(user_id, name, "server", caption, false)?,
            DeviceSelector::Remote { remote_id, name } => {
                debug!(user_id, %remote_id, name, "resolving remote device");
                self.resolve_virtual_device(user_id, name)?
            }
        };

        self.get_device(user_id, id)
            .ok_or(StateError::UnknownDevice {
                user_id,
                device_id: id,
            })
    }

    /// Record a completed pass on the device
    pub fn touch_last_sync(&self, user_id: i64, device_id: DeviceId) -> Result<(), StateError> {
        self.state.transaction(|data| {
            if let Some(device) = data
                .devices
                .iter_mut()
                .find(|d| d.user_id == user_id && d.id == device_id)
            {
                device.last_sync = Some(Utc::now());
            }
            Ok(())
        })
    }

    /// Delete a device together with its cursor row.
    ///
    /// If it was the default, the oldest remaining device takes over.
    pub fn remove_device(&self, user_id: i64, device_id: DeviceId) -> Result<bool, StateError> {
        self.state.transaction(|data| {
            let Some(index) = data
                .devices
                .iter()
                .position(|d| d.user_id == user_id && d.id == device_id)
            else {
                return Ok(false);
            };

            let removed = data.devices.remove(index);
            data.cursors
                .retain(|c| !(c.user_id == user_id && c.device_id == device_id));

            let successor = oldest(data, user_id).map(|d| d.id);
            if removed.is_default
                && let Some(next) = successor
            {
                mark_default(data, user_id, next);
            }

            info!(user_id, %device_id, "removed sync device");
            Ok(true)
        })
    }

    fn ensure_not_system(&self, user_id: i64) -> Result<(), StateError> {
        if user_id == self.system_user_id {
            return Err(StateError::SystemUser(user_id));
        }
        Ok(())
    }
}

fn find_by_name(data: &SyncStateData, user_id: i64, name: &str) -> Option<usize> {
    data.devices
        .iter()
        .position(|d| d.user_id == user_id && d.name == name)
}

fn oldest(data: &SyncStateData, user_id: i64) -> Option<&Device> {
    data.devices
        .iter()
        .filter(|d| d.user_id == user_id)
        .min_by_key(|d| (d.created_at, d.id))
}

fn insert_device(
    data: &mut SyncStateData,
    user_id: i64,
    name: &str,
    device_type: &str,
    caption: Option<&str>,
    now: DateTime<Utc>,
) -> DeviceId {
    data.last_device_id += 1;
    let id = DeviceId(data.last_device_id);
    data.devices.push(Device {
        id,
        user_id,
        name: name.to_string(),
        device_type: device_type.to_string(),
        caption: caption.map(String::from),
        is_default: false,
        is_active: true,
        created_at: now,
        last_sync: None,
    });
    id
}

fn mark_default(data: &mut SyncStateData, user_id: i64, device_id: DeviceId) {
    for device in data.devices.iter_mut().filter(|d| d.user_id == user_id) {
        device.is_default = device.id == device_id;
    }
}

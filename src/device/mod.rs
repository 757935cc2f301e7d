mod registry;

pub use registry::{Device, DeviceId, DeviceRegistry, DeviceSelector, REMOTE_DEVICE_TYPE};

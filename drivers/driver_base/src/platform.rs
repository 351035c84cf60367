//! Device lifecycle contract between a driver and the host platform.

use crate::{DeviceKind, DriverResult};

/// Keys of the binding properties a driver attaches to a published device.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DevicePropKey {
    /// Vendor (manufacturer) identifier.
    VendorId,
    /// Product identifier.
    ProductId,
}

/// A single binding property of a published device.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DeviceProp {
    /// Property key.
    pub key: DevicePropKey,
    /// Property value.
    pub value: u32,
}

impl DeviceProp {
    /// Creates a new property.
    pub const fn new(key: DevicePropKey, value: u32) -> Self {
        Self { key, value }
    }
}

/// Arguments used to publish a device to the platform.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAddArgs<'a> {
    /// Device name, e.g. `"sdmmc"`.
    pub name: &'a str,
    /// Device category the device is published as.
    pub kind: DeviceKind,
    /// Binding properties.
    pub props: &'a [DeviceProp],
    /// Whether the device starts hidden until [`DevicePlatform::make_visible`].
    pub invisible: bool,
}

/// Operations a driver uses to register, publish and remove its device.
///
/// A platform instance tracks exactly one device on behalf of one driver
/// instance.
pub trait DevicePlatform: Send + Sync {
    /// Registers the device.
    fn add_device(&self, args: &DeviceAddArgs<'_>) -> DriverResult;

    /// Makes a device registered with `invisible` set visible to clients.
    fn make_visible(&self);

    /// Removes the registered device.
    fn remove_device(&self);

    /// Registers the device again as a different category, after the
    /// previous registration has been removed.
    fn re_register_as(&self, args: &DeviceAddArgs<'_>) -> DriverResult;
}

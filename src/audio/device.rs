use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, info};

use crate::config::DeviceSelector;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub index: usize,
    pub name: String,
    pub input_channels: u16,
    pub is_default: bool,
}

/// Picks an input device from `devices`.
///
/// An explicit index wins outright. A name is matched case-insensitively as a
/// substring, preferring devices with at least `required_channels` inputs and
/// then any device with that name. With no name at all the system default
/// input is used, else the first device that has inputs. Nothing suitable is
/// `DeviceNotFound`, carrying the names that were available.
pub fn select_device(
    devices: &[InputDeviceInfo],
    selector: &DeviceSelector,
    required_channels: u16,
) -> Result<usize> {
    let not_found = || Error::DeviceNotFound {
        requested: selector.to_string(),
        available: devices.iter().map(|d| d.name.clone()).collect(),
    };

    match selector {
        DeviceSelector::Index(index) => devices
            .iter()
            .position(|d| d.index == *index)
            .ok_or_else(not_found),
        DeviceSelector::Name(name) if name.trim().is_empty() => devices
            .iter()
            .position(|d| d.is_default && d.input_channels > 0)
            .or_else(|| devices.iter().position(|d| d.input_channels > 0))
            .ok_or_else(not_found),
        DeviceSelector::Name(name) => {
            let needle = name.to_lowercase();
            let matches = |d: &InputDeviceInfo| d.name.to_lowercase().contains(&needle);

            devices
                .iter()
                .position(|d| matches(d) && d.input_channels >= required_channels)
                .or_else(|| devices.iter().position(matches))
                .ok_or_else(not_found)
        }
    }
}

fn max_input_channels(device: &cpal::Device) -> u16 {
    device
        .supported_input_configs()
        .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

fn enumerate() -> Result<Vec<(cpal::Device, InputDeviceInfo)>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| Error::DeviceNotFound {
            requested: format!("input devices ({e})"),
            available: Vec::new(),
        })?;

    Ok(devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| format!("<device {index}>"));
            let info = InputDeviceInfo {
                index,
                is_default: default_name.as_deref() == Some(name.as_str()),
                input_channels: max_input_channels(&device),
                name,
            };
            (device, info)
        })
        .collect())
}

pub fn list_input_devices() -> Result<Vec<InputDeviceInfo>> {
    Ok(enumerate()?.into_iter().map(|(_, info)| info).collect())
}

/// Resolves `selector` against the host's devices and returns the device.
pub fn open_input_device(
    selector: &DeviceSelector,
    required_channels: u16,
) -> Result<(cpal::Device, InputDeviceInfo)> {
    let mut devices = enumerate()?;
    let infos: Vec<InputDeviceInfo> = devices.iter().map(|(_, info)| info.clone()).collect();
    for info in &infos {
        debug!(
            "Input device {}: {} ({} ch{})",
            info.index,
            info.name,
            info.input_channels,
            if info.is_default { ", default" } else { "" }
        );
    }

    let position = select_device(&infos, selector, required_channels)?;
    let (device, info) = devices.swap_remove(position);
    info!(
        "Using input device {}: {} ({} ch)",
        info.index, info.name, info.input_channels
    );
    Ok((device, info))
}

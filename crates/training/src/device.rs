use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use serde::{Deserialize, Serialize};

/// Environment variable that pins every run to the CPU regardless of the
/// requested backend.
pub const FORCE_CPU_ENV: &str = "CANDLE_FORCE_CPU";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// Metal, then CUDA, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

fn force_cpu() -> bool {
    std::env::var(FORCE_CPU_ENV)
        .map(|value| {
            let value = value.trim();
            !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
        })
        .unwrap_or(false)
}

/// Resolves a device, falling back to the CPU whenever the requested
/// accelerator is missing or fails to initialise.
pub fn select_device(preference: DevicePreference) -> Device {
    if force_cpu() {
        log::info!("{FORCE_CPU_ENV} is set; using CPU");
        return Device::Cpu;
    }

    let want_metal = matches!(preference, DevicePreference::Auto | DevicePreference::Metal);
    let want_cuda = matches!(preference, DevicePreference::Auto | DevicePreference::Cuda);

    if want_metal && metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("using Metal GPU #0");
                return device;
            }
            Err(err) => log::warn!("failed to initialise Metal device: {err}"),
        }
    }

    if want_cuda && cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => {
                log::info!("using CUDA GPU #0");
                return device;
            }
            Err(err) => log::warn!("failed to initialise CUDA device: {err}"),
        }
    }

    if preference != DevicePreference::Cpu && preference != DevicePreference::Auto {
        log::warn!("requested {preference:?} backend is unavailable; falling back to CPU");
    }
    Device::Cpu
}

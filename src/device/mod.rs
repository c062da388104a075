//! Device handle, driver boundary and the `rtl_sdr` backend

mod driver;
#[cfg(test)]
pub(crate) mod fake;
pub mod process;
mod radio;
mod state;

pub use driver::{validate_sample_rate, AgcMode, Driver, GainMode};
pub use process::{
    device_count, device_name, device_usb_strings, DeviceInfo, ProbeReport, RtlSdrProcess,
    UsbStrings, DEFAULT_RTL_SDR_PATH,
};
pub use radio::Radio;
pub use state::RadioSettings;

//! Direct NVML calls for the MIG queries nvml-wrapper does not expose.
//!
//! NVML keeps its state per process, so these calls share the session opened
//! through nvml-wrapper; [`RawNvml`] still takes its own reference with
//! `nvmlInit_v2` so that it stays valid on its own.

use std::ffi::CStr;

use error_stack::Report;
use libc::c_char;
use libc::c_int;
use libc::c_uint;
use libc::c_ulonglong;
use libc::c_void;
use libloading::Library;

use super::PlatformError;

type NvmlReturn = c_int;
type NvmlDevice = *mut c_void;

const NVML_SUCCESS: NvmlReturn = 0;
const NVML_ERROR_INVALID_ARGUMENT: NvmlReturn = 2;
const NVML_ERROR_NOT_SUPPORTED: NvmlReturn = 3;
const NVML_ERROR_NOT_FOUND: NvmlReturn = 6;

const NVML_DEVICE_MIG_ENABLE: c_uint = 1;
const NVML_DEVICE_UUID_BUFFER_SIZE: usize = 96;

/// GPU instance profile ids, `NVML_GPU_INSTANCE_PROFILE_1_SLICE` to
/// `NVML_GPU_INSTANCE_PROFILE_4_SLICE_GFX`.
pub(crate) const GPU_INSTANCE_PROFILE_IDS: std::ops::RangeInclusive<c_uint> = 0x0..=0xC;
const PROFILE_1_SLICE_REV1: c_uint = 0x7;
const PROFILE_2_SLICE_REV1: c_uint = 0x8;
const PROFILE_1_SLICE_GFX: c_uint = 0xA;
const PROFILE_4_SLICE_GFX: c_uint = 0xC;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DeviceAttributes {
    pub multiprocessor_count: c_uint,
    pub shared_copy_engine_count: c_uint,
    pub shared_decoder_count: c_uint,
    pub shared_encoder_count: c_uint,
    pub shared_jpeg_count: c_uint,
    pub shared_ofa_count: c_uint,
    pub gpu_instance_slice_count: c_uint,
    pub compute_instance_slice_count: c_uint,
    pub memory_size_mb: c_ulonglong,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct GpuInstanceProfileInfo {
    pub id: c_uint,
    pub is_p2p_supported: c_uint,
    pub slice_count: c_uint,
    pub instance_count: c_uint,
    pub multiprocessor_count: c_uint,
    pub copy_engine_count: c_uint,
    pub decoder_count: c_uint,
    pub encoder_count: c_uint,
    pub jpeg_count: c_uint,
    pub ofa_count: c_uint,
    pub memory_size_mb: c_ulonglong,
}

/// Attribute a GPU instance profile id adds to the profile name.
pub(crate) fn profile_attribute(profile_id: c_uint) -> Option<&'static str> {
    match profile_id {
        PROFILE_1_SLICE_REV1 | PROFILE_2_SLICE_REV1 => Some("me"),
        PROFILE_1_SLICE_GFX..=PROFILE_4_SLICE_GFX => Some("gfx"),
        _ => None,
    }
}

/// A handle to a physical or MIG device. Only valid while the owning
/// [`RawNvml`] is alive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceHandle(NvmlDevice);

pub(crate) struct RawNvml {
    lib: Library,
}

impl std::fmt::Debug for RawNvml {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawNvml").finish_non_exhaustive()
    }
}

fn check(ret: NvmlReturn, operation: &str) -> Result<(), Report<PlatformError>> {
    if ret == NVML_SUCCESS {
        Ok(())
    } else {
        Err(Report::new(PlatformError::Nvml {
            operation: operation.to_string(),
        })
        .attach_printable(format!("nvmlReturn_t {ret}")))
    }
}

impl RawNvml {
    pub(crate) fn load(library: &str) -> Result<Self, Report<PlatformError>> {
        // SAFETY: NVML has no load-time side effects beyond its own constructors
        let lib = unsafe { Library::new(library) }.map_err(|e| {
            Report::new(PlatformError::NvmlUnavailable).attach_printable(e.to_string())
        })?;
        let raw = Self { lib };

        // SAFETY: nvmlInit_v2 takes no arguments
        let ret = unsafe {
            let init = raw.symbol::<unsafe extern "C" fn() -> NvmlReturn>(b"nvmlInit_v2\0")?;
            init()
        };
        check(ret, "nvmlInit_v2")?;
        Ok(raw)
    }

    /// # Safety
    ///
    /// `T` must match the C signature of `name`.
    unsafe fn symbol<T>(&self, name: &[u8]) -> Result<libloading::Symbol<'_, T>, Report<PlatformError>> {
        self.lib.get::<T>(name).map_err(|e| {
            Report::new(PlatformError::Nvml {
                operation: String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
                    .into_owned(),
            })
            .attach_printable(e.to_string())
        })
    }

    pub(crate) fn device_by_index(&self, index: u32) -> Result<DeviceHandle, Report<PlatformError>> {
        let mut device: NvmlDevice = std::ptr::null_mut();
        // SAFETY: out pointer is valid for the duration of the call
        let ret = unsafe {
            let f = self.symbol::<unsafe extern "C" fn(c_uint, *mut NvmlDevice) -> NvmlReturn>(
                b"nvmlDeviceGetHandleByIndex_v2\0",
            )?;
            f(index, &mut device)
        };
        check(ret, "nvmlDeviceGetHandleByIndex_v2")?;
        Ok(DeviceHandle(device))
    }

    /// Current MIG mode, or `None` when the GPU is not MIG capable.
    pub(crate) fn mig_enabled(&self, device: DeviceHandle) -> Result<Option<bool>, Report<PlatformError>> {
        let mut current: c_uint = 0;
        let mut pending: c_uint = 0;
        // SAFETY: handle comes from this library, out pointers are valid
        let ret = unsafe {
            let f = self.symbol::<unsafe extern "C" fn(NvmlDevice, *mut c_uint, *mut c_uint) -> NvmlReturn>(
                b"nvmlDeviceGetMigMode\0",
            )?;
            f(device.0, &mut current, &mut pending)
        };
        if ret == NVML_ERROR_NOT_SUPPORTED {
            return Ok(None);
        }
        check(ret, "nvmlDeviceGetMigMode")?;
        Ok(Some(current == NVML_DEVICE_MIG_ENABLE))
    }

    /// MIG devices currently carved out of `device`, with their slot index.
    pub(crate) fn mig_devices(
        &self,
        device: DeviceHandle,
    ) -> Result<Vec<(u32, DeviceHandle)>, Report<PlatformError>> {
        let mut max: c_uint = 0;
        // SAFETY: handle comes from this library, out pointer is valid
        let ret = unsafe {
            let f = self.symbol::<unsafe extern "C" fn(NvmlDevice, *mut c_uint) -> NvmlReturn>(
                b"nvmlDeviceGetMaxMigDeviceCount\0",
            )?;
            f(device.0, &mut max)
        };
        check(ret, "nvmlDeviceGetMaxMigDeviceCount")?;

        // SAFETY: signature matches nvmlDeviceGetMigDeviceHandleByIndex
        let by_index = unsafe {
            self.symbol::<unsafe extern "C" fn(NvmlDevice, c_uint, *mut NvmlDevice) -> NvmlReturn>(
                b"nvmlDeviceGetMigDeviceHandleByIndex\0",
            )?
        };

        let mut devices = Vec::new();
        for index in 0..max {
            let mut mig: NvmlDevice = std::ptr::null_mut();
            // SAFETY: handle comes from this library, out pointer is valid
            let ret = unsafe { by_index(device.0, index, &mut mig) };
            if ret == NVML_ERROR_NOT_FOUND {
                continue;
            }
            check(ret, "nvmlDeviceGetMigDeviceHandleByIndex")?;
            devices.push((index, DeviceHandle(mig)));
        }
        Ok(devices)
    }

    pub(crate) fn uuid(&self, device: DeviceHandle) -> Result<String, Report<PlatformError>> {
        let mut buffer = [0 as c_char; NVML_DEVICE_UUID_BUFFER_SIZE];
        // SAFETY: buffer length is passed alongside the buffer
        let ret = unsafe {
            let f = self.symbol::<unsafe extern "C" fn(NvmlDevice, *mut c_char, c_uint) -> NvmlReturn>(
                b"nvmlDeviceGetUUID\0",
            )?;
            f(device.0, buffer.as_mut_ptr(), buffer.len() as c_uint)
        };
        check(ret, "nvmlDeviceGetUUID")?;
        // SAFETY: NVML null terminates the UUID within the buffer on success
        let uuid = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        Ok(uuid.to_string_lossy().into_owned())
    }

    pub(crate) fn attributes(&self, device: DeviceHandle) -> Result<DeviceAttributes, Report<PlatformError>> {
        let mut attributes = DeviceAttributes::default();
        // SAFETY: DeviceAttributes mirrors nvmlDeviceAttributes_t
        let ret = unsafe {
            let f = self.symbol::<unsafe extern "C" fn(NvmlDevice, *mut DeviceAttributes) -> NvmlReturn>(
                b"nvmlDeviceGetAttributes_v2\0",
            )?;
            f(device.0, &mut attributes)
        };
        check(ret, "nvmlDeviceGetAttributes_v2")?;
        Ok(attributes)
    }

    /// GPU instance profile details, or `None` when the GPU does not offer it.
    pub(crate) fn gpu_instance_profile(
        &self,
        device: DeviceHandle,
        profile_id: c_uint,
    ) -> Result<Option<GpuInstanceProfileInfo>, Report<PlatformError>> {
        let mut info = GpuInstanceProfileInfo::default();
        // SAFETY: GpuInstanceProfileInfo mirrors nvmlGpuInstanceProfileInfo_t
        let ret = unsafe {
            let f = self.symbol::<unsafe extern "C" fn(NvmlDevice, c_uint, *mut GpuInstanceProfileInfo) -> NvmlReturn>(
                b"nvmlDeviceGetGpuInstanceProfileInfo\0",
            )?;
            f(device.0, profile_id, &mut info)
        };
        match ret {
            NVML_ERROR_NOT_SUPPORTED | NVML_ERROR_INVALID_ARGUMENT => Ok(None),
            _ => {
                check(ret, "nvmlDeviceGetGpuInstanceProfileInfo")?;
                Ok(Some(info))
            }
        }
    }
}

impl Drop for RawNvml {
    fn drop(&mut self) {
        // SAFETY: balances the nvmlInit_v2 in `load`
        let ret = unsafe {
            match self.symbol::<unsafe extern "C" fn() -> NvmlReturn>(b"nvmlShutdown\0") {
                Ok(shutdown) => shutdown(),
                Err(_) => return,
            }
        };
        if ret != NVML_SUCCESS {
            tracing::warn!(code = ret, "nvmlShutdown failed");
        }
    }
}

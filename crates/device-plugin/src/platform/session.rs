use std::sync::Arc;

use error_stack::Report;

use super::DeviceLib;
use super::PlatformError;

/// An open NVML session, released when dropped.
///
/// Shutdown errors on release are logged, never returned.
#[derive(Debug)]
pub struct NvmlSession {
    lib: Arc<dyn DeviceLib>,
}

impl NvmlSession {
    pub fn open(lib: Arc<dyn DeviceLib>) -> Result<Self, Report<PlatformError>> {
        lib.init()?;
        Ok(Self { lib })
    }

    pub fn lib(&self) -> &Arc<dyn DeviceLib> {
        &self.lib
    }
}

impl Drop for NvmlSession {
    fn drop(&mut self) {
        if let Err(e) = self.lib.shutdown() {
            tracing::error!("Error shutting down NVML: {e:?}");
        }
    }
}

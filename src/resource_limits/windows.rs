//! Windows backend: capability probe only
//!
//! Job objects carry the memory and CPU limits on Windows. Children are only
//! spawned on Unix hosts, so nothing here applies them; the capability check tells callers
//! what the host would offer.
use super::Feature;
use std::sync::OnceLock;
use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::System::JobObjects::CreateJobObjectW;

pub struct WindowsLimiter;

impl WindowsLimiter {
    /// Memory and CPU need a job object; probed once
    pub fn supports(feature: Feature) -> bool {
        static JOB_OBJECTS: OnceLock<bool> = OnceLock::new();
        match feature {
            Feature::WallTime => true,
            Feature::Decorator => false,
            Feature::Memory | Feature::CpuTime => *JOB_OBJECTS.get_or_init(|| unsafe {
                let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
                if job == 0 {
                    false
                } else {
                    CloseHandle(job);
                    true
                }
            }),
        }
    }
}

//! FFI bindings for embedding the Synheart runtime from other languages.
//!
//! All functions are C-compatible, null-terminated-string based, and run
//! against one process-wide [`SynheartEngine`] driven by a lazily-started
//! Tokio runtime — the facade itself is async, so every binding blocks on
//! that runtime rather than exposing `async` across the FFI boundary.
//! Strings returned by this module must be freed with
//! [`synheart_free_string`].

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::{Arc, OnceLock};

use tokio::runtime::Runtime;

use crate::adapters::{InMemoryBehaviorAdapter, InMemoryPhoneAdapter, InMemoryWearAdapter};
use crate::config::{DeviceIdentity, RuntimeConfig};
use crate::error::Channel;
use crate::storage::InMemoryStore;
use crate::SynheartEngine;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: impl std::fmt::Display) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg.to_string()).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new().expect("failed to start FFI tokio runtime"))
}

/// In-memory-adapter engine, suitable for hosts that bridge their own
/// platform sensors into the spooled `InMemory*Adapter::push` calls from
/// native code rather than implementing a `XSourceAdapter` in Rust.
fn engine() -> &'static Arc<SynheartEngine> {
    static ENGINE: OnceLock<Arc<SynheartEngine>> = OnceLock::new();
    ENGINE.get_or_init(|| {
        Arc::new(SynheartEngine::new(
            Arc::new(InMemoryStore::new()),
            InMemoryWearAdapter::new(),
            InMemoryPhoneAdapter::new(),
            InMemoryBehaviorAdapter::new(),
        ))
    })
}

fn channel_from_code(code: i32) -> Option<Channel> {
    match code {
        0 => Some(Channel::Biosignals),
        1 => Some(Channel::Motion),
        2 => Some(Channel::Behavior),
        _ => None,
    }
}

/// Initializes the process-wide engine with a generated device identity.
///
/// # Safety
/// Returns 0 on success, non-zero on error; call `synheart_last_error` for
/// details.
#[no_mangle]
pub unsafe extern "C" fn synheart_initialize(auto_start: i32) -> i32 {
    clear_last_error();
    let result = runtime().block_on(async {
        let device = DeviceIdentity {
            device_id: uuid::Uuid::new_v4().to_string(),
            platform: "ffi".into(),
        };
        let config = RuntimeConfig::new(device).with_auto_start(auto_start != 0);
        engine().initialize(config).await
    });
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// # Safety
/// Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn synheart_start_data_collection() -> i32 {
    clear_last_error();
    match runtime().block_on(engine().start_data_collection()) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// # Safety
/// Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn synheart_stop_data_collection() -> i32 {
    clear_last_error();
    match runtime().block_on(engine().stop_data_collection()) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// Grants consent for the listed channels; any flag not passed as
/// non-zero is treated as denied.
///
/// # Safety
/// Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn synheart_grant_consent(
    biosignals: i32,
    behavior: i32,
    motion: i32,
    cloud_upload: i32,
) -> i32 {
    clear_last_error();
    let result = runtime().block_on(engine().grant_consent(
        biosignals != 0,
        behavior != 0,
        motion != 0,
        cloud_upload != 0,
    ));
    match result {
        Ok(_) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// `channel`: 0 = biosignals, 1 = motion, 2 = behavior.
///
/// # Safety
/// Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn synheart_revoke_consent(channel: i32) -> i32 {
    clear_last_error();
    let Some(channel) = channel_from_code(channel) else {
        set_last_error("invalid channel code");
        return -1;
    };
    match runtime().block_on(engine().revoke_consent(channel)) {
        Ok(_) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// Returns the current consent snapshot as a JSON string, or NULL on
/// error.
///
/// # Safety
/// Caller must free the returned pointer with `synheart_free_string`.
#[no_mangle]
pub unsafe extern "C" fn synheart_get_consent_status_json() -> *mut c_char {
    clear_last_error();
    match runtime().block_on(engine().get_consent_status()) {
        Ok(snapshot) => match serde_json::to_string(&snapshot) {
            Ok(json) => string_to_cstr(&json),
            Err(e) => {
                set_last_error(e);
                ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(e);
            ptr::null_mut()
        }
    }
}

/// # Safety
/// Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn synheart_dispose() -> i32 {
    clear_last_error();
    match runtime().block_on(engine().dispose()) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// # Safety
/// `ptr` must be a valid pointer returned by a `synheart_*` function, or
/// NULL.
#[no_mangle]
pub unsafe extern "C" fn synheart_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// # Safety
/// Returns a pointer to a thread-local error string, valid until the next
/// `synheart_*` call on this thread. Do NOT free. Returns NULL if no
/// error occurred.
#[no_mangle]
pub unsafe extern "C" fn synheart_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// # Safety
/// Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn synheart_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_non_empty() {
        unsafe {
            let version = synheart_version();
            assert!(!version.is_null());
            assert!(!CStr::from_ptr(version).to_str().unwrap().is_empty());
        }
    }

    #[test]
    fn initialize_then_consent_round_trip() {
        unsafe {
            assert_eq!(synheart_initialize(0), 0);
            assert_eq!(synheart_grant_consent(1, 0, 0, 0), 0);
            let status = synheart_get_consent_status_json();
            assert!(!status.is_null());
            let json = CStr::from_ptr(status).to_str().unwrap();
            assert!(json.contains("\"biosignals\":true"));
            synheart_free_string(status);
            assert_eq!(synheart_dispose(), 0);
        }
    }
}

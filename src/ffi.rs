//! C ABI
//!
//! Flat `extern "C"` functions over [`Engine`]. Conventions:
//!
//! - Status calls return `0` or a negative [`ErrorCode`].
//! - Calls creating a rule or route return its id (`> 0`) or a negative code.
//! - Calls returning data hand out a heap JSON string the caller releases with
//!   [`phantom_fw_free_string`]; `NULL` signals failure.
//! - After any failure, [`phantom_fw_last_error`] describes it. The message
//!   is kept per calling thread.
//!
//! Engines are addressed by handles from a generation-checked arena, so a
//! handle used after `close` fails with `InvalidHandle` instead of touching
//! freed memory. String arguments may be `NULL`, which reads as empty.

use crate::config;
use crate::core::engine::Engine;
use crate::core::error::{Error, ErrorCode, Result};
use crate::core::firewall::Family;
use crate::core::legacy::LegacyRule;
use crate::core::rule_constraints::{RouteText, RuleText};
use crate::logging;
use crate::validators;
use serde::Serialize;
use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::net::IpAddr;
use std::ptr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, info};

// ═══════════════════════════════════════════════════════════════════════════
// Handle arena
// ═══════════════════════════════════════════════════════════════════════════

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

/// Slot storage addressed by `(generation << 32) | (index + 1)` handles.
///
/// Removing a value bumps its slot's generation, so stale handles never
/// resolve to a later occupant. Handle `0` is never issued.
pub struct HandleArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleArena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn handle(index: usize, generation: u32) -> u64 {
        (u64::from(generation) << 32) | (index as u64 + 1)
    }

    fn locate(&self, handle: u64) -> Option<usize> {
        let index = usize::try_from(handle & 0xffff_ffff).ok()?.checked_sub(1)?;
        let generation = u32::try_from(handle >> 32).ok()?;
        let slot = self.slots.get(index)?;
        (slot.generation == generation && slot.value.is_some()).then_some(index)
    }

    pub fn insert(&mut self, value: T) -> u64 {
        let value = Some(Arc::new(value));
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.value = value;
            return Self::handle(index, slot.generation);
        }
        self.slots.push(Slot {
            generation: 0,
            value,
        });
        Self::handle(self.slots.len() - 1, 0)
    }

    pub fn get(&self, handle: u64) -> Option<Arc<T>> {
        let index = self.locate(handle)?;
        self.slots[index].value.clone()
    }

    pub fn remove(&mut self, handle: u64) -> Option<Arc<T>> {
        let index = self.locate(handle)?;
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        slot.value.take()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static ENGINES: Mutex<HandleArena<Engine>> = Mutex::new(HandleArena::new());

fn engines() -> std::sync::MutexGuard<'static, HandleArena<Engine>> {
    ENGINES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `f` on the engine behind `handle`; the arena lock is not held meanwhile.
fn with_engine<T>(handle: u64, f: impl FnOnce(&Engine) -> Result<T>) -> Result<T> {
    let engine = engines().get(handle).ok_or(Error::InvalidHandle)?;
    f(&engine)
}

// ═══════════════════════════════════════════════════════════════════════════
// Result marshalling
// ═══════════════════════════════════════════════════════════════════════════

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

fn to_cstring(text: &str) -> CString {
    CString::new(text.replace('\0', " ")).unwrap_or_default()
}

fn set_last_error(message: &str) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = to_cstring(message));
}

fn fail(e: &Error) -> ErrorCode {
    debug!("C ABI call failed: {e}");
    set_last_error(&e.to_string());
    e.code()
}

fn status<T>(result: Result<T>) -> i32 {
    match result {
        Ok(_) => ErrorCode::Ok.as_i32(),
        Err(e) => fail(&e).as_i32(),
    }
}

fn id(result: Result<i64>) -> i64 {
    result.unwrap_or_else(|e| i64::from(fail(&e).as_i32()))
}

fn json<T: Serialize>(result: Result<T>) -> *mut c_char {
    let text = result.and_then(|value| serde_json::to_string(&value).map_err(Error::from));
    match text {
        Ok(text) => to_cstring(&text).into_raw(),
        Err(e) => {
            fail(&e);
            ptr::null_mut()
        }
    }
}

/// Borrows a C string argument; `NULL` reads as empty.
fn arg<'a>(name: &str, ptr: *const c_char) -> Result<&'a str> {
    if ptr.is_null() {
        return Ok("");
    }
    // SAFETY: the caller passes a NUL-terminated string that outlives the call
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| Error::validation(name, "not valid UTF-8"))
}

fn required<'a>(name: &str, ptr: *const c_char) -> Result<&'a str> {
    let value = arg(name, ptr)?;
    if value.is_empty() {
        return Err(Error::validation(name, "is required"));
    }
    Ok(value)
}

fn network(name: &str, ptr: *const c_char) -> Result<ipnetwork::IpNetwork> {
    let text = required(name, ptr)?;
    validators::parse_optional_network(text)
        .map_err(|e| Error::validation(name, e))?
        .ok_or_else(|| Error::validation(name, "a network is required"))
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Creates an engine on the store at `db_path` and writes its handle.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_init(db_path: *const c_char, out_handle: *mut u64) -> i32 {
    status((|| {
        if out_handle.is_null() {
            return Err(Error::validation("out_handle", "is required"));
        }
        let path = required("db_path", db_path)?;
        let engine = Engine::system(config::load_config())?;
        engine.init(path)?;
        let handle = engines().insert(engine);
        // SAFETY: checked non-null above; the caller owns the pointee
        unsafe { out_handle.write(handle) };
        info!("Engine handle {handle:#x} opened on {path}");
        Ok(())
    })())
}

/// Status report JSON
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_get_status(handle: u64) -> *mut c_char {
    json(with_engine(handle, Engine::status_report))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_start(handle: u64) -> i32 {
    status(with_engine(handle, Engine::start))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_stop(handle: u64) -> i32 {
    status(with_engine(handle, Engine::stop))
}

/// Closes the store and invalidates `handle`; the kernel is left as it is.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_close(handle: u64) -> i32 {
    status((|| {
        let engine = engines().remove(handle).ok_or(Error::InvalidHandle)?;
        engine.close()
    })())
}

// ═══════════════════════════════════════════════════════════════════════════
// Groups
// ═══════════════════════════════════════════════════════════════════════════

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_create_group(
    handle: u64,
    name: *const c_char,
    group_type: *const c_char,
    priority: i32,
) -> i32 {
    status((|| {
        let name = arg("name", name)?;
        let group_type = arg("group_type", group_type)?;
        with_engine(handle, |e| e.create_group(name, group_type, priority))
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_delete_group(handle: u64, name: *const c_char) -> i32 {
    status(arg("name", name).and_then(|name| with_engine(handle, |e| e.delete_group(name))))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_enable_group(handle: u64, name: *const c_char) -> i32 {
    status(arg("name", name).and_then(|name| with_engine(handle, |e| e.enable_group(name))))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_disable_group(handle: u64, name: *const c_char) -> i32 {
    status(arg("name", name).and_then(|name| with_engine(handle, |e| e.disable_group(name))))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_list_groups(handle: u64) -> *mut c_char {
    json(with_engine(handle, Engine::list_groups))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_get_group(handle: u64, name: *const c_char) -> *mut c_char {
    json(arg("name", name).and_then(|name| with_engine(handle, |e| e.get_group(name))))
}

// ═══════════════════════════════════════════════════════════════════════════
// Firewall rules
// ═══════════════════════════════════════════════════════════════════════════

/// Adds a firewall rule; `family` is `AF_INET` (2) or `AF_INET6` (10).
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_add_rule(
    handle: u64,
    group_name: *const c_char,
    chain: *const c_char,
    rule_type: *const c_char,
    family: u8,
    proto: *const c_char,
    dport: u16,
    source: *const c_char,
    destination: *const c_char,
    in_iface: *const c_char,
    out_iface: *const c_char,
    state_match: *const c_char,
) -> i64 {
    id((|| {
        let group = arg("group_name", group_name)?;
        let spec = RuleText {
            chain: arg("chain", chain)?,
            rule_type: arg("rule_type", rule_type)?,
            family: Family::from_af(family)
                .ok_or_else(|| Error::validation("family", format!("unknown family {family}")))?,
            proto: arg("proto", proto)?,
            dport,
            source: arg("source", source)?,
            destination: arg("destination", destination)?,
            in_iface: arg("in_iface", in_iface)?,
            out_iface: arg("out_iface", out_iface)?,
            state_match: arg("state_match", state_match)?,
        }
        .parse()?;
        with_engine(handle, |e| e.add_rule(group, spec)).map(|rule| rule.id)
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_remove_rule(handle: u64, rule_id: i64) -> i32 {
    status(with_engine(handle, |e| e.remove_rule(rule_id)))
}

/// Rules of `group_name`, or of every group when it is `NULL` or empty
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_list_rules(handle: u64, group_name: *const c_char) -> *mut c_char {
    json(arg("group_name", group_name).and_then(|group| {
        with_engine(handle, |e| e.list_rules((!group.is_empty()).then_some(group)))
    }))
}

// ═══════════════════════════════════════════════════════════════════════════
// Routing rules
// ═══════════════════════════════════════════════════════════════════════════

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_add_route(
    handle: u64,
    group_name: *const c_char,
    rule_type: *const c_char,
    from_network: *const c_char,
    to_network: *const c_char,
    table_name: *const c_char,
    table_id: u32,
    priority: u32,
    destination: *const c_char,
    device: *const c_char,
    fwmark: u32,
) -> i64 {
    id((|| {
        let group = arg("group_name", group_name)?;
        let spec = RouteText {
            rule_type: arg("rule_type", rule_type)?,
            from_network: arg("from_network", from_network)?,
            to_network: arg("to_network", to_network)?,
            table_name: arg("table_name", table_name)?,
            table_id,
            priority,
            destination: arg("destination", destination)?,
            device: arg("device", device)?,
            fwmark,
        }
        .parse()?;
        with_engine(handle, |e| e.add_route(group, spec)).map(|route| route.id)
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_remove_route(handle: u64, route_id: i64) -> i32 {
    status(with_engine(handle, |e| e.remove_route(route_id)))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_list_routes(handle: u64, group_name: *const c_char) -> *mut c_char {
    json(arg("group_name", group_name).and_then(|group| {
        with_engine(handle, |e| e.list_routes((!group.is_empty()).then_some(group)))
    }))
}

// ═══════════════════════════════════════════════════════════════════════════
// Presets
// ═══════════════════════════════════════════════════════════════════════════

/// Applies the VPN server preset; returns the created group as JSON.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_apply_preset_vpn(
    handle: u64,
    name: *const c_char,
    wg_iface: *const c_char,
    wg_port: u16,
    wg_subnet: *const c_char,
    out_iface: *const c_char,
) -> *mut c_char {
    json((|| {
        let name = arg("name", name)?;
        let wg_iface = arg("wg_iface", wg_iface)?;
        let subnet = network("wg_subnet", wg_subnet)?;
        let out_iface = arg("out_iface", out_iface)?;
        with_engine(handle, |e| {
            e.apply_preset_vpn(name, wg_iface, wg_port, subnet, out_iface)
        })
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_apply_preset_multihop(
    handle: u64,
    name: *const c_char,
    in_iface: *const c_char,
    out_iface: *const c_char,
    fwmark: u32,
    table_id: u32,
    subnet: *const c_char,
) -> *mut c_char {
    json((|| {
        let name = arg("name", name)?;
        let in_iface = arg("in_iface", in_iface)?;
        let out_iface = arg("out_iface", out_iface)?;
        let subnet = network("subnet", subnet)?;
        with_engine(handle, |e| {
            e.apply_preset_multihop(name, in_iface, out_iface, fwmark, table_id, subnet)
        })
    })())
}

/// `wstunnel_port` 0 omits the TCP transport rule.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_apply_preset_kill_switch(
    handle: u64,
    wg_port: u16,
    wstunnel_port: u16,
    wg_iface: *const c_char,
) -> *mut c_char {
    json(arg("wg_iface", wg_iface).and_then(|wg_iface| {
        with_engine(handle, |e| {
            e.apply_preset_kill_switch(wg_port, wstunnel_port, wg_iface)
        })
    }))
}

/// `dns_servers` is a comma separated address list and may be empty.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_apply_preset_dns_protection(
    handle: u64,
    dns_servers: *const c_char,
    wg_iface: *const c_char,
) -> *mut c_char {
    json((|| {
        let servers = arg("dns_servers", dns_servers)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| Error::validation("dns_servers", format!("invalid address '{s}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        let wg_iface = arg("wg_iface", wg_iface)?;
        with_engine(handle, |e| e.apply_preset_dns_protection(&servers, wg_iface))
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_apply_preset_ipv6_block(handle: u64) -> *mut c_char {
    json(with_engine(handle, Engine::apply_preset_ipv6_block))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_remove_preset(handle: u64, name: *const c_char) -> i32 {
    status(arg("name", name).and_then(|name| with_engine(handle, |e| e.remove_preset(name))))
}

// ═══════════════════════════════════════════════════════════════════════════
// Verification
// ═══════════════════════════════════════════════════════════════════════════

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_get_kernel_state(handle: u64) -> *mut c_char {
    json(with_engine(handle, Engine::get_kernel_state))
}

/// Drift report JSON; an out-of-sync kernel is still a successful call.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_verify_rules(handle: u64) -> *mut c_char {
    json(with_engine(handle, Engine::verify_rules))
}

// ═══════════════════════════════════════════════════════════════════════════
// Utility
// ═══════════════════════════════════════════════════════════════════════════

/// Version string; static, must not be freed.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_get_version() -> *const c_char {
    static VERSION: OnceLock<CString> = OnceLock::new();
    VERSION
        .get_or_init(|| to_cstring(&crate::version_string()))
        .as_ptr()
}

/// Message of the last failure on the calling thread (empty if none).
///
/// Valid until the next failing call on the same thread; must not be freed.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ptr())
}

/// Releases a string returned by this library. `NULL` is ignored.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_free_string(text: *mut c_char) {
    if !text.is_null() {
        // SAFETY: `text` came from `CString::into_raw` in `json`
        drop(unsafe { CString::from_raw(text) });
    }
}

/// `level`: 0 error, 1 warn, 2 info, 3 debug
pub type LogCallback = extern "C" fn(level: c_int, message: *const c_char, context: *mut c_void);

struct CallbackTarget {
    callback: LogCallback,
    context: *mut c_void,
}

// SAFETY: the context pointer is opaque to us and only handed back to the
// callback, which the caller registered knowing it runs on another thread.
unsafe impl Send for CallbackTarget {}
unsafe impl Sync for CallbackTarget {}

impl CallbackTarget {
    fn call(&self, level: i32, message: &str) {
        let text = to_cstring(message);
        (self.callback)(level, text.as_ptr(), self.context);
    }
}

fn callback_sink(callback: LogCallback, context: *mut c_void) -> logging::LogSink {
    let target = CallbackTarget { callback, context };
    Box::new(move |level, message| target.call(level, message))
}

/// Routes log events to `callback` on a dedicated thread; `NULL` disables.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_set_log_callback(
    callback: Option<LogCallback>,
    context: *mut c_void,
) -> i32 {
    let capacity = config::load_config().log_queue_capacity;
    let Some(dispatcher) = logging::global(capacity) else {
        return status::<()>(Err(Error::Internal("log dispatcher unavailable".into())));
    };
    match callback {
        Some(callback) => {
            dispatcher.set_sink(Some(callback_sink(callback, context)));
        }
        None => dispatcher.set_sink(None),
    }
    ErrorCode::Ok.as_i32()
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_flush_route_cache(handle: u64) -> i32 {
    status(with_engine(handle, Engine::flush_route_cache))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_enable_ip_forward(handle: u64) -> i32 {
    status(with_engine(handle, Engine::enable_ip_forward))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_flush_firewall_table(handle: u64) -> i32 {
    status(with_engine(handle, Engine::flush_firewall_table))
}

// ═══════════════════════════════════════════════════════════════════════════
// Stateless entry point
// ═══════════════════════════════════════════════════════════════════════════

static LEGACY: OnceLock<std::result::Result<Engine, String>> = OnceLock::new();

/// Process-wide engine without persistence backing the handle-less calls
fn legacy_engine() -> Result<&'static Engine> {
    LEGACY
        .get_or_init(|| {
            let engine = Engine::system(config::load_config()).map_err(|e| e.to_string())?;
            engine.init(":memory:").map_err(|e| e.to_string())?;
            Ok(engine)
        })
        .as_ref()
        .map_err(|e| Error::InvalidState(format!("stateless engine unavailable: {e}")))
}

fn legacy_rule(rule_json: *const c_char) -> Result<LegacyRule> {
    let text = required("rule", rule_json)?;
    serde_json::from_str(text).map_err(|e| Error::validation("rule", e.to_string()))
}

/// Applies one rule given as JSON (`{"kind": "filter", ...}` or
/// `{"kind": "route", ...}`) without a group or persistence.
#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_legacy_apply_rule(rule_json: *const c_char) -> i32 {
    status(legacy_rule(rule_json).and_then(|rule| legacy_engine()?.legacy_apply_rule(&rule)))
}

#[unsafe(no_mangle)]
pub extern "C" fn phantom_fw_legacy_remove_rule(rule_json: *const c_char) -> i32 {
    status(legacy_rule(rule_json).and_then(|rule| legacy_engine()?.legacy_remove_rule(&rule)))
}

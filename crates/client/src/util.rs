//! Small wasm-bindgen helpers shared across the controller.

use wasm_bindgen::prelude::*;
use web_sys::Window;

/// The global `window`. Safe to unwrap: this crate only runs inside a
/// browser document.
pub fn window() -> Window {
    web_sys::window().expect("relay-client must run in a browser window")
}

/// Wrapper around a `setInterval` handle; clears the interval on drop so a
/// dropped controller doesn't keep ticking.
pub struct IntervalHandle(pub i32);

impl Drop for IntervalHandle {
    fn drop(&mut self) {
        window().clear_interval_with_handle(self.0);
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch, per
/// `Date.now()` — used instead of `std::time` which isn't wired up on
/// `wasm32-unknown-unknown` outside a handful of polyfilled crates.
pub fn now_ms() -> f64 {
    js_sys::Date::now()
}

pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

#[wasm_bindgen]
pub fn init_logging() {
    wasm_logger::init(wasm_logger::Config::default());
}

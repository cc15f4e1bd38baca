//! Browser-side adaptive-bitrate WHEP controller. Compiled to wasm and
//! driven from JS; the pure-logic modules (`levels`, `metrics`, `penalty`,
//! `state`) carry their own host-runnable unit tests.

pub mod controller;
pub mod levels;
pub mod metrics;
pub mod penalty;
pub mod state;
pub mod util;
pub mod whep;

use wasm_bindgen::prelude::*;

use controller::AdaptiveController;
use levels::{LevelEntry, LevelTable};
use whep::HttpWhepEndpoint;

pub use levels::Level;
pub use whep::{WhepEndpoint, WhepSession};

/// JS-facing handle. Wraps [`AdaptiveController`] over the real `fetch`
/// backed [`HttpWhepEndpoint`]; tests exercise `AdaptiveController` directly
/// against a fake `WhepEndpoint` instead of going through this wrapper.
#[wasm_bindgen]
pub struct RelayController {
    inner: AdaptiveController<HttpWhepEndpoint>,
}

#[wasm_bindgen]
impl RelayController {
    /// `levels_json` is a JSON array of `{level: {id, label, maxBitrateKbps,
    /// audioOnly}, fallbackChain: [...]}`, high to low.
    #[wasm_bindgen(constructor)]
    pub fn new(whep_url: String, levels_json: String) -> Result<RelayController, JsValue> {
        util::init_panic_hook();

        let entries: Vec<LevelEntry> =
            serde_json::from_str(&levels_json).map_err(|e| JsValue::from_str(&format!("invalid level table: {e}")))?;
        let levels = LevelTable::new(entries);
        let endpoint = HttpWhepEndpoint::new(whep_url);

        let mut inner = AdaptiveController::new(endpoint, levels);
        inner.start();
        Ok(RelayController { inner })
    }

    /// Requests an explicit switch to the level at `index` in the table
    /// passed to the constructor.
    #[wasm_bindgen(js_name = switchTo)]
    pub fn switch_to(&mut self, index: usize) {
        self.inner.switch_to(index);
    }

    #[wasm_bindgen(js_name = currentLevelId)]
    pub fn current_level_id(&self) -> Option<String> {
        self.inner.current_level_id()
    }

    #[wasm_bindgen(js_name = stateLabel)]
    pub fn state_label(&self) -> String {
        format!("{:?}", self.inner.state())
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

//! Switch accessory exposed to the host
//! Wraps a session's read/write bridge with the accessory name and logs every
//! host-side get/set the same way for every accessory.

use std::sync::Mutex;

use log::{error, info};

use crate::core::bluetooth::{
    BridgeError, ConnectionState, SessionHandle, SessionView, StateListener, on_off,
};

/// A BLE switch registered with the host
#[derive(Clone)]
pub struct SwitchAccessory {
    name: String,
    session: SessionHandle,
}

impl SwitchAccessory {
    pub fn new(name: impl Into<String>, session: SessionHandle) -> Self {
        Self {
            name: name.into(),
            session,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn view(&self) -> SessionView {
        self.session.view()
    }

    /// Host query for the current on/off value
    pub async fn get_on(&self) -> Result<bool, BridgeError> {
        match self.session.get_state().await {
            Ok(value) => {
                info!("[{}] (by:Homekit) -> {}", self.name, on_off(value));
                Ok(value)
            }
            Err(e) => {
                error!("[{}] (by:Homekit) -> [ERROR] could not read state: {}", self.name, e);
                Err(e)
            }
        }
    }

    /// Host request to switch on or off
    pub async fn set_on(&self, value: bool) -> Result<(), BridgeError> {
        match self.session.set_state(value).await {
            Ok(()) => {
                info!("[{}] (by:Homekit) -> {}", self.name, on_off(value));
                Ok(())
            }
            Err(e) => {
                error!(
                    "[{}] (by:Homekit) -> [ERROR] could not switch {}: {}",
                    self.name,
                    on_off(value),
                    e
                );
                Err(e)
            }
        }
    }
}

/// Listener that logs state pushed by the peripheral and remembers the last value
pub struct LoggingListener {
    name: String,
    last: Mutex<Option<bool>>,
}

impl LoggingListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last: Mutex::new(None),
        }
    }

    /// Last value reported by the peripheral, if any
    pub fn last_value(&self) -> Option<bool> {
        self.last.lock().ok().and_then(|last| *last)
    }
}

impl StateListener for LoggingListener {
    fn on_state_changed(&self, value: bool) {
        info!("[{}] (by:Homekit) <- {}", self.name, on_off(value));
        if let Ok(mut last) = self.last.lock() {
            *last = Some(value);
        }
    }
}

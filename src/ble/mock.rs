//! In-memory radio backend
//!
//! Records every command it is given and lets the caller inject adapter events
//! by hand. Used by the test suites and for driving the session layer without
//! hardware.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::adapter::{
    AdapterError, AdapterState, DeviceId, EventSink, RadioAdapter, RadioEvent, ScanFilter,
    WriteMode,
};

/// A command issued to the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    Scan(ScanFilter),
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics {
        device: DeviceId,
        service: Uuid,
    },
    Read {
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        data: Vec<u8>,
        mode: WriteMode,
    },
    SetNotify {
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    },
}

/// Scriptable [`RadioAdapter`]
pub struct MockRadio {
    initial_state: Option<AdapterState>,
    sink: Mutex<Option<EventSink>>,
    history: Mutex<Vec<RadioCommand>>,
    issued_tx: mpsc::UnboundedSender<RadioCommand>,
    issued_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RadioCommand>>,
    failures: Mutex<VecDeque<AdapterError>>,
}

impl MockRadio {
    /// Radio that reports nothing until told to
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_initial_state(None))
    }

    /// Radio that reports `PoweredOn` as soon as a sink is registered
    pub fn powered_on() -> Arc<Self> {
        Arc::new(Self::with_initial_state(Some(AdapterState::PoweredOn)))
    }

    fn with_initial_state(initial_state: Option<AdapterState>) -> Self {
        let (issued_tx, issued_rx) = mpsc::unbounded_channel();
        Self {
            initial_state,
            sink: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            issued_tx,
            issued_rx: tokio::sync::Mutex::new(issued_rx),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Push an event to the session manager; `false` if no sink is registered
    pub fn emit(&self, event: RadioEvent) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    /// Every command issued so far, in order
    pub fn commands(&self) -> Vec<RadioCommand> {
        self.history.lock().clone()
    }

    /// Wait for the next command not yet taken by a previous call
    pub async fn next_command(&self) -> Option<RadioCommand> {
        self.issued_rx.lock().await.recv().await
    }

    /// Make the next issued command fail with `error`
    pub fn fail_next_command(&self, error: AdapterError) {
        self.failures.lock().push_back(error);
    }

    fn issue(&self, command: RadioCommand) -> Result<(), AdapterError> {
        tracing::debug!("mock radio command: {:?}", command);
        self.history.lock().push(command.clone());
        let _ = self.issued_tx.send(command);
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RadioAdapter for MockRadio {
    fn set_event_sink(&self, sink: EventSink) {
        if let Some(state) = self.initial_state {
            let _ = sink.send(RadioEvent::PowerStateChanged(state));
        }
        *self.sink.lock() = Some(sink);
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<(), AdapterError> {
        self.issue(RadioCommand::Scan(filter.clone()))
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.issue(RadioCommand::StopScan)
    }

    async fn connect(&self, device: &str) -> Result<(), AdapterError> {
        self.issue(RadioCommand::Connect(device.to_string()))
    }

    async fn disconnect(&self, device: &str) -> Result<(), AdapterError> {
        self.issue(RadioCommand::Disconnect(device.to_string()))
    }

    async fn discover_services(&self, device: &str) -> Result<(), AdapterError> {
        self.issue(RadioCommand::DiscoverServices(device.to_string()))
    }

    async fn discover_characteristics(
        &self,
        device: &str,
        service: Uuid,
    ) -> Result<(), AdapterError> {
        self.issue(RadioCommand::DiscoverCharacteristics {
            device: device.to_string(),
            service,
        })
    }

    async fn read_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), AdapterError> {
        self.issue(RadioCommand::Read {
            device: device.to_string(),
            service,
            characteristic,
        })
    }

    async fn write_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), AdapterError> {
        self.issue(RadioCommand::Write {
            device: device.to_string(),
            service,
            characteristic,
            data: data.to_vec(),
            mode,
        })
    }

    async fn set_notify(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), AdapterError> {
        self.issue(RadioCommand::SetNotify {
            device: device.to_string(),
            service,
            characteristic,
            enabled,
        })
    }
}

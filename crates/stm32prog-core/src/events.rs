//! Event system for UI decoupling.
//!
//! Front-ends subscribe to session progress without the engines knowing
//! anything about how it is displayed.

use std::fmt;

use crate::state::Phase;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Which engine produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Serial,
    Usb,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Serial => write!(f, "serial"),
            Channel::Usb => write!(f, "usb"),
        }
    }
}

/// Events emitted while a programming session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramEvent {
    /// Host connected: serial sync byte or USB enumeration.
    Connected { channel: Channel },
    /// Phase changed.
    PhaseChanged { from: Phase, to: Phase },
    /// Data accepted for the current phase.
    Progress { phase: Phase, offset: u64 },
    /// Layout parsed and devices initialized.
    LayoutReady { partitions: usize, devices: usize },
    /// Partition fully transferred.
    PartitionDone { id: u8, name: String, size: u64 },
    /// OTP or PMIC image committed.
    NvmCommitted { phase: Phase },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Session error, phase forced to reset.
    Error { message: String },
    /// Host requested the final reset.
    ResetRequested,
    /// Every selected partition programmed.
    Complete,
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait ProgramObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ProgramEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ProgramObserver for NullObserver {
    fn on_event(&self, _event: &ProgramEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ProgramObserver for TracingObserver {
    fn on_event(&self, event: &ProgramEvent) {
        match event {
            ProgramEvent::Connected { channel } => {
                tracing::info!(channel = %channel, "Host connected");
            }
            ProgramEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            ProgramEvent::Progress { phase, offset } => {
                tracing::trace!(phase = %phase, offset = %format!("0x{:x}", offset), "Progress");
            }
            ProgramEvent::LayoutReady {
                partitions,
                devices,
            } => {
                tracing::info!(partitions, devices, "FlashLayout ready");
            }
            ProgramEvent::PartitionDone { id, name, size } => {
                tracing::info!(
                    id = %format!("0x{:02x}", id),
                    name = %name,
                    size = %format!("0x{:x}", size),
                    "Partition done"
                );
            }
            ProgramEvent::NvmCommitted { phase } => {
                tracing::info!(phase = %phase, "NVM image committed");
            }
            ProgramEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            ProgramEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            ProgramEvent::ResetRequested => {
                tracing::info!("Reset requested");
            }
            ProgramEvent::Complete => {
                tracing::info!("Phase=END");
            }
        }
    }
}

/// Observer that keeps every event, for tests and scripted front-ends.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<ProgramEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgramEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProgramObserver for RecordingObserver {
    fn on_event(&self, event: &ProgramEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

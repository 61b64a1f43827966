//! Import configuration types
//!
//! This module defines the knobs of a single segment import. Anything that
//! depends on the caller's runtime (the cancellation token, the progress
//! channel) is passed separately through [`crate::ImportControl`].

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Configuration for one segment import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Whether decoded CAN signals are written to the sample table
    /// (raw frames are always stored)
    #[serde(default = "default_true")]
    pub materialize_can_signals: bool,

    /// Optional: only turn these vehicle-state message types into samples
    #[serde(default)]
    pub message_types: Option<Vec<String>>,

    /// Publish progress every N messages
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,

    /// How far after the first message a GPS fix may appear and still
    /// anchor the wall clock (seconds)
    #[serde(default = "default_gps_search_window_secs")]
    pub gps_search_window_secs: u64,

    /// Whether to auto-create definitions for unknown structured signals
    /// after the segment is committed
    #[serde(default = "default_true")]
    pub auto_create_definitions: bool,

    /// Optional: abort the import cooperatively once this instant passes
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

fn default_true() -> bool {
    true
}

fn default_progress_interval() -> u64 {
    1000
}

fn default_gps_search_window_secs() -> u64 {
    60
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            materialize_can_signals: true,
            message_types: None,
            progress_interval: default_progress_interval(),
            gps_search_window_secs: default_gps_search_window_secs(),
            auto_create_definitions: true,
            deadline: None,
        }
    }
}

impl ImportConfig {
    /// Create a new import configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: enable or disable CAN signal materialization
    pub fn with_can_materialization(mut self, enabled: bool) -> Self {
        self.materialize_can_signals = enabled;
        self
    }

    /// Builder method: set the structured message-type allow list
    pub fn with_message_types(mut self, types: Vec<String>) -> Self {
        self.message_types = Some(types);
        self
    }

    /// Builder method: set the progress publishing interval
    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    /// Builder method: set the GPS search window
    pub fn with_gps_search_window(mut self, window: Duration) -> Self {
        self.gps_search_window_secs = window.as_secs();
        self
    }

    /// Builder method: enable or disable definition auto-creation
    pub fn with_auto_create_definitions(mut self, enabled: bool) -> Self {
        self.auto_create_definitions = enabled;
        self
    }

    /// Builder method: set an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Builder method: set a deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn gps_search_window(&self) -> Duration {
        Duration::from_secs(self.gps_search_window_secs)
    }

    /// Check if a structured message type should become samples
    pub fn should_process_message_type(&self, message_type: &str) -> bool {
        match &self.message_types {
            Some(types) => types.iter().any(|t| t == message_type),
            None => true,
        }
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }
}

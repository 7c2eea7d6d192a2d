//! Subcommand implementations.

pub mod capabilities;
pub mod dispatch;
pub mod health;
pub mod validate;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::domain::models::Event;

#[derive(Deserialize)]
#[serde(untagged)]
enum EventsFile {
    Many(Vec<Event>),
    One(Event),
}

/// Read one event object or an array of events from a JSON file.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read events from {}", path.display()))?;
    let parsed: EventsFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse events in {}", path.display()))?;

    Ok(match parsed {
        EventsFile::Many(events) => events,
        EventsFile::One(event) => vec![event],
    })
}

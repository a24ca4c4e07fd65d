//! Activity provider traits and implementations
//!
//! This module defines the interface for looking up pool-based activities and
//! their capacity bounds, along with the static catalog used by default.

use crate::error::{RendezvousError, Result};
use crate::types::CapacityBounds;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Largest room the matchmaking engine will ever form
pub const MAX_ACTIVITY_PLAYERS: usize = 16;

/// Configuration for a single pool-based activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityConfiguration {
    /// Activity name as announced by clients
    pub name: String,
    /// Minimum number of members a matched room needs
    pub min_players: usize,
    /// Maximum number of members in a matched room
    pub max_players: usize,
    /// Two-party audio/video activity, capped at 2 regardless of max_players
    #[serde(default)]
    pub media: bool,
}

impl ActivityConfiguration {
    pub fn new(name: &str, min_players: usize, max_players: usize) -> Self {
        Self {
            name: name.to_string(),
            min_players,
            max_players,
            media: false,
        }
    }

    /// One-on-one text chat
    pub fn chat() -> Self {
        Self::new("chat", 2, 2)
    }

    /// One-on-one audio/video call
    pub fn video() -> Self {
        Self {
            media: true,
            ..Self::new("video", 2, 2)
        }
    }

    /// Small group quiz
    pub fn trivia() -> Self {
        Self::new("trivia", 3, 6)
    }

    /// Shared drawing board
    pub fn drawing() -> Self {
        Self::new("drawing", 2, 8)
    }

    /// Effective capacity bounds, with the media cap applied
    pub fn bounds(&self) -> CapacityBounds {
        let max = if self.media {
            self.max_players.min(2)
        } else {
            self.max_players
        };
        CapacityBounds {
            min: self.min_players,
            max,
        }
    }
}

/// Trait for providing activity configurations
pub trait ActivityProvider: Send + Sync {
    /// Get configuration for an activity by name
    fn get_activity(&self, name: &str) -> Option<ActivityConfiguration>;

    /// Get all known activity names
    fn available_activities(&self) -> Vec<String>;

    /// Activity used when a session declares none it is eligible for
    fn default_activity(&self) -> String;

    /// Validate if an activity configuration is valid
    fn validate_config(&self, config: &ActivityConfiguration) -> Result<()>;
}

/// Static activity provider backed by a fixed catalog
#[derive(Debug, Clone)]
pub struct StaticActivityProvider {
    activities: Vec<ActivityConfiguration>,
    default_activity: String,
}

impl StaticActivityProvider {
    /// Create a provider with the built-in catalog
    pub fn new() -> Self {
        Self {
            activities: vec![
                ActivityConfiguration::chat(),
                ActivityConfiguration::video(),
                ActivityConfiguration::trivia(),
                ActivityConfiguration::drawing(),
            ],
            default_activity: "chat".to_string(),
        }
    }

    /// Create with a custom catalog
    pub fn with_activities(
        activities: Vec<ActivityConfiguration>,
        default_activity: &str,
    ) -> Result<Self> {
        let provider = Self {
            activities,
            default_activity: default_activity.to_string(),
        };

        let mut seen = HashSet::new();
        for config in &provider.activities {
            provider.validate_config(config)?;
            if !seen.insert(config.name.as_str()) {
                return Err(RendezvousError::ConfigurationError {
                    message: format!("Duplicate activity name: {}", config.name),
                }
                .into());
            }
        }

        if provider.get_activity(default_activity).is_none() {
            return Err(RendezvousError::ConfigurationError {
                message: format!("Default activity '{}' is not in the catalog", default_activity),
            }
            .into());
        }

        Ok(provider)
    }
}

impl Default for StaticActivityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityProvider for StaticActivityProvider {
    fn get_activity(&self, name: &str) -> Option<ActivityConfiguration> {
        self.activities.iter().find(|a| a.name == name).cloned()
    }

    fn available_activities(&self) -> Vec<String> {
        self.activities.iter().map(|a| a.name.clone()).collect()
    }

    fn default_activity(&self) -> String {
        self.default_activity.clone()
    }

    fn validate_config(&self, config: &ActivityConfiguration) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(RendezvousError::ConfigurationError {
                message: "Activity name cannot be empty".to_string(),
            }
            .into());
        }

        if config.name.contains('|') {
            return Err(RendezvousError::ConfigurationError {
                message: format!("Activity name '{}' cannot contain '|'", config.name),
            }
            .into());
        }

        if config.min_players == 0 {
            return Err(RendezvousError::ConfigurationError {
                message: format!("Activity '{}' needs at least 1 player", config.name),
            }
            .into());
        }

        if config.min_players > config.max_players {
            return Err(RendezvousError::ConfigurationError {
                message: format!(
                    "Activity '{}' minimum ({}) exceeds maximum ({})",
                    config.name, config.min_players, config.max_players
                ),
            }
            .into());
        }

        if config.max_players > MAX_ACTIVITY_PLAYERS {
            return Err(RendezvousError::ConfigurationError {
                message: format!(
                    "Activity '{}' cannot exceed {} players",
                    config.name, MAX_ACTIVITY_PLAYERS
                ),
            }
            .into());
        }

        if config.media && config.max_players > 2 {
            return Err(RendezvousError::ConfigurationError {
                message: format!("Media activity '{}' is limited to 2 players", config.name),
            }
            .into());
        }

        Ok(())
    }
}

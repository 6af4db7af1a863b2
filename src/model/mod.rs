//! Domain records: events, correlation groups, action recommendations.

pub mod action;
pub mod event;
pub mod group;

pub use action::{
    ActionLink, ActionRecommendation, ActionStatus, ActionType, Feedback, Priority,
    MAX_ESTIMATED_MINUTES, MAX_TITLE_CHARS, MIN_ESTIMATED_MINUTES,
};
pub use event::{AppendResult, Event, EventType, Platform};
pub use group::{CorrelationGroup, GroupStatus, MAX_GROUP_MEMBERS};

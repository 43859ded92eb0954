//! Table names of the hosted schema.

pub const PROFILES: &str = "profiles";
pub const SWIPES: &str = "swipes";
pub const MATCHES: &str = "matches";
pub const MESSAGES: &str = "messages";
pub const MATCH_PROPOSALS: &str = "match_proposals";
pub const NOTIFICATIONS: &str = "notifications";

/// The topic name used when a caller does not specify one, matching the
/// original `'default'` topic string.
pub const DEFAULT_TOPIC: &str = "default";

/// Delimiter between the components of an instance id (the last segment of a registry key)
pub const INSTANCE_ID_DELIMITER: char = ':';

/// Position of the exposed service port within an instance id, e.g. `host:name:80`
pub const SERVICE_PORT_INDEX: usize = 2;

/// Delimiter between address and port in a registry value, e.g. `10.0.0.1:8080`
pub const INSTANCE_VALUE_DELIMITER: char = ':';

/// Consecutive watch failures tolerated before the watch handle is re-established
pub const DEFAULT_WATCH_ERROR_THRESHOLD: u32 = 5;

/// HAProxy section and identifier prefixes
pub const FRONTEND_PREFIX: &str = "input";
pub const BACKEND_PREFIX: &str = "backend";
pub const SERVER_PREFIX: &str = "instance";

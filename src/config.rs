// Client defaults. Each can be overridden on the command line.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
pub const SERVER_URL_ENV: &str = "FORGE_SERVER";
pub const DEFAULT_SESSION: &str = "default";

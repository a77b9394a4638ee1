/// mDNS service type for collector self-advertisement
pub const COLLECTOR_SERVICE_TYPE: &str = "_blecollector._tcp.local.";

/// TXT record keys used in collector self-advertisement
pub const TXT_API: &str = "api";
pub const TXT_AUX: &str = "aux";

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Field has not been resolved yet
pub const SENTINEL_UNPOPULATED: &str = "[unpopulated]";
/// Organization of a random (static) address; never looked up
pub const SENTINEL_RANDOM: &str = "[random]";
/// Organization of a private address, or an OUI missing from the reference table
pub const SENTINEL_PRIVATE: &str = "[private]";
/// Vendor absent or missing from the reference table
pub const SENTINEL_UNKNOWN: &str = "[unknown]";

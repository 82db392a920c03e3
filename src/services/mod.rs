pub mod campaign_catalog;
pub mod cdp_browser_driver;
pub mod channel_scheduler;
pub mod claim_service;
pub mod cookie_jar_service;
pub mod diagnostic_logger;
pub mod kick_api_client;
pub mod liveness_service;
pub mod mining_service;
pub mod queue_service;
pub mod session_context;
pub mod thumbnail_cache_service;
pub mod watch_session_service;

#[cfg(test)]
pub mod test_support;

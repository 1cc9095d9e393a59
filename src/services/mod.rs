pub mod credentials;
pub mod mpesa_service;
pub mod token_cache;

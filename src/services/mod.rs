pub mod public_url;
pub mod storage_service;

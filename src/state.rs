use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::services::credentials::CredentialResolver;
use crate::services::mpesa_service::MpesaService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub resolver: CredentialResolver,
    pub mpesa_service: Arc<MpesaService>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        let mpesa_service = Arc::new(MpesaService::new(&config)?);

        Ok(AppState {
            resolver: CredentialResolver::new(config.clone()),
            config: Arc::new(config),
            mpesa_service,
        })
    }
}

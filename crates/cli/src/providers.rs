use std::sync::Arc;

use sparkfleet_core::{CloudAdapter, FleetError, Settings};
use sparkfleet_lambda::Lambda;

const API_KEY_ENV: &str = "LAMBDA_API_KEY";

/// Build the cloud adapter for the configured provider.
pub fn cloud_adapter(settings: &Settings) -> Result<CloudAdapter, FleetError> {
    let lambda = &settings.lambda;
    let api_key = lambda
        .api_key
        .clone()
        .or_else(|| std::env::var(API_KEY_ENV).ok())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| {
            FleetError::Config(format!(
                "no Lambda Cloud API key: set [lambda] api-key or {}",
                API_KEY_ENV
            ))
        })?;

    let provider = Lambda::new(api_key, lambda.region.clone(), lambda.base_url.clone());
    Ok(CloudAdapter::new(Arc::new(provider), lambda.poll_settings()))
}

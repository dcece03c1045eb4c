use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sparkfleet_core::{
    InstanceDescription, InstanceProvider, InstanceRequest, InstanceState, MarketType,
    ProviderError,
};
use tracing::debug;

pub const BASE_URL: &str = "https://cloud.lambda.ai/api/v1/";

/// Error codes the API uses when a launch cannot be satisfied for capacity reasons.
const CAPACITY_CODES: &[&str] = &[
    "instance-operations/launch/insufficient-capacity",
    "global/quota-exceeded",
];

pub struct Lambda {
    api_key: String,
    region: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct LaunchRequest {
    region_name: String,
    instance_type_name: String,
    ssh_key_names: Vec<String>,
    name: String,
}

#[derive(Deserialize)]
struct LaunchResponse {
    data: LaunchResponseData,
}

#[derive(Deserialize)]
struct LaunchResponseData {
    instance_ids: Vec<String>,
}

#[derive(Deserialize)]
struct InfoResponse {
    data: InfoResponseData,
}

#[derive(Deserialize)]
struct InfoResponseData {
    id: String,
    #[serde(default)]
    ip: Option<String>,
    status: String,
}

#[derive(Serialize)]
struct TerminateRequest<'a> {
    instance_ids: &'a [String],
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

impl Lambda {
    /// `region` is used for role-groups that do not name a placement.
    pub fn new(api_key: String, region: Option<String>, base_url: Option<String>) -> Lambda {
        let mut base_url = base_url.unwrap_or_else(|| BASE_URL.to_string());
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Lambda {
            api_key,
            region,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, payload: &T) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.api_key, None::<&str>)
            .header("accept", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("Request failed: {}", e)))?;
        read_body(response).await
    }

    async fn get(&self, path: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&self.api_key, None::<&str>)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("Request failed: {}", e)))?;
        read_body(response).await
    }
}

async fn read_body(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ProviderError::Api(format!("Failed to read response body: {}", e)))?;
    if !status.is_success() {
        return Err(classify_error(status, &text));
    }
    Ok(text)
}

fn parse<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, ProviderError> {
    serde_json::from_str(text).map_err(|e| {
        ProviderError::Api(format!("Failed to parse response: {} - Response body: {}", e, text))
    })
}

/// Map a failed API response onto the provider error taxonomy.
fn classify_error(status: StatusCode, body: &str) -> ProviderError {
    let api_error = serde_json::from_str::<ErrorResponse>(body).ok().map(|r| r.error);
    match api_error {
        Some(error) if CAPACITY_CODES.contains(&error.code.as_str()) => {
            ProviderError::QuotaExceeded(error.message)
        }
        Some(error) if status == StatusCode::NOT_FOUND => ProviderError::NotFound(error.message),
        None if status == StatusCode::NOT_FOUND => ProviderError::NotFound(body.to_string()),
        Some(error) => ProviderError::Api(format!("API Error ({}): {}: {}", status, error.code, error.message)),
        None => ProviderError::Api(format!("API Error ({}): {}", status, body)),
    }
}

fn instance_state(status: &str) -> InstanceState {
    match status {
        "booting" => InstanceState::Pending,
        "active" | "unhealthy" => InstanceState::Running,
        "terminating" => InstanceState::ShuttingDown,
        "terminated" => InstanceState::Terminated,
        _ => InstanceState::Pending,
    }
}

#[async_trait]
impl InstanceProvider for Lambda {
    fn name(&self) -> &str {
        "lambda"
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, ProviderError> {
        if request.market_type == MarketType::Spot {
            return Err(ProviderError::Api(
                "Lambda Cloud does not offer spot instances".to_string(),
            ));
        }
        let region = request
            .placement
            .clone()
            .or_else(|| self.region.clone())
            .ok_or_else(|| ProviderError::Api("No region configured for Lambda Cloud".to_string()))?;

        let payload = LaunchRequest {
            region_name: region,
            instance_type_name: request.instance_type.clone(),
            ssh_key_names: vec![request.key_name.clone()],
            name: request.name.clone(),
        };
        let text = self.post("instance-operations/launch", &payload).await?;
        let launch: LaunchResponse = parse(&text)?;

        let instance_id = launch
            .data
            .instance_ids
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Api("No instance ID returned".to_string()))?;
        debug!(instance = %request.name, id = %instance_id, "Lambda launch accepted");
        Ok(instance_id)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription, ProviderError> {
        let text = match self.get(&format!("instances/{}", instance_id)).await {
            Err(ProviderError::NotFound(_)) => {
                return Err(ProviderError::NotFound(instance_id.to_string()));
            }
            other => other?,
        };
        let info: InfoResponse = parse(&text)?;
        Ok(InstanceDescription {
            id: info.data.id,
            state: instance_state(&info.data.status),
            public_ip: info.data.ip.filter(|ip| !ip.is_empty()),
        })
    }

    async fn request_termination(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        let payload = TerminateRequest { instance_ids };
        match self.post("instance-operations/terminate", &payload).await {
            Ok(_) => Ok(()),
            Err(ProviderError::NotFound(_)) => Err(ProviderError::NotFound(instance_ids.join(", "))),
            Err(e) => Err(e),
        }
    }
}
